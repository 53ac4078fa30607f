//! DispatchSim CLI
//!
//! Terminal client for the call-taker training simulator: place calls,
//! converse with the simulated caller, and review completed calls.

mod cli;
mod cmd_call;
mod cmd_history;
mod cmd_scenarios;
mod cmd_status;
mod config;
mod logging;
mod paths;

use std::sync::Arc;

use clap::{CommandFactory, Parser};
use dispatchsim_core::{Identity, ScenarioCatalog, SessionController, SessionStore};
use dispatchsim_transport::{Delivery, DeliveryMode, HttpSimulationApi, WsPushChannel};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::ClientConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "dispatchsim", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let log_handle = logging::init_logging()?;

    let file = config::load_file(&paths::config_path())?;
    let config = ClientConfig::resolve(cli.overrides(), file);

    info!(
        component = "cli",
        event = "cli.start",
        version = VERSION,
        run_id = %log_handle.run_id,
        data_dir = %data_dir.display(),
        api_url = %config.api_url,
        mode = %config.mode,
        trainee_id = %config.trainee_id,
        "DispatchSim starting"
    );

    let catalog = Arc::new(ScenarioCatalog::load(Some(&paths::catalog_override_path()))?);
    let store = SessionStore::open(&paths::db_path())?;

    match cli.command {
        Commands::Scenarios { event_type } => {
            cmd_scenarios::run(&catalog, event_type.as_deref());
        }
        Commands::History(cmd) => {
            cmd_history::run(cmd, &store, &config.trainee_id).await?;
        }
        Commands::Status => {
            let api = HttpSimulationApi::new(&config.api_url, config.auth_token.clone())?;
            cmd_status::run(&data_dir, &config, &api, &store).await?;
        }
        Commands::Call {
            code,
            subtype,
            no_ring,
        } => {
            let controller = build_controller(&config, store, catalog)?;
            let ring = if no_ring {
                std::time::Duration::ZERO
            } else {
                config.pickup_delay
            };
            cmd_call::place(&controller, &code, subtype, ring).await?;
        }
        Commands::Resume { session_id } => {
            let controller = build_controller(&config, store, catalog)?;
            match session_id {
                Some(id) => cmd_call::resume(&controller, &id).await?,
                None => cmd_call::list_active(&controller).await?,
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn build_controller(
    config: &ClientConfig,
    store: SessionStore,
    catalog: Arc<ScenarioCatalog>,
) -> anyhow::Result<Arc<SessionController>> {
    let api = Arc::new(HttpSimulationApi::new(
        &config.api_url,
        config.auth_token.clone(),
    )?);
    let delivery = match config.mode {
        DeliveryMode::Polling => Delivery::Polling,
        DeliveryMode::Streaming => Delivery::Streaming(Arc::new(WsPushChannel::new(
            config.ws_url.clone(),
            config.auth_token.clone(),
        ))),
    };
    let identity = Identity {
        trainee_id: config.trainee_id.clone(),
        auth_token: config.auth_token.clone(),
    };

    Ok(Arc::new(
        SessionController::new(identity, api, delivery, store).with_catalog(catalog),
    ))
}
