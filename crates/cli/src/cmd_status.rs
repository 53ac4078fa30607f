//! `dispatchsim status`: configuration, local storage, and service health.

use std::path::Path;

use console::style;
use dispatchsim_core::SessionStore;
use dispatchsim_transport::{HttpSimulationApi, SimulationApi};

use crate::config::ClientConfig;
use crate::paths;
use crate::VERSION;

pub async fn run(
    data_dir: &Path,
    config: &ClientConfig,
    api: &HttpSimulationApi,
    store: &SessionStore,
) -> anyhow::Result<()> {
    println!();
    println!("  DispatchSim v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());
    println!("  Trainee:  {}", config.trainee_id);
    println!("  API:      {}", api.base_url());
    match config.mode {
        dispatchsim_transport::DeliveryMode::Streaming => {
            println!("  Delivery: streaming ({})", config.ws_url)
        }
        dispatchsim_transport::DeliveryMode::Polling => println!("  Delivery: polling"),
    }

    match api.health().await {
        Ok(health) => {
            let sessions = health
                .active_sessions
                .map(|n| format!(", {n} sessions on server"))
                .unwrap_or_default();
            println!("  Health:   {} {}{}", style("●").green(), health.status, sessions);
        }
        Err(e) => println!("  Health:   {} unreachable ({e})", style("●").red()),
    }

    let size = store.size_bytes().await?;
    println!("  Database: {} ({} KB)", paths::db_path().display(), size / 1024);

    let active = store.list_active(&config.trainee_id).await?.len();
    let history = store.list_history(&config.trainee_id).await?.len();
    println!("  Calls:    {active} active, {history} completed");

    if active > 0 {
        println!();
        println!("  Resume an open call with: dispatchsim resume");
    }
    println!();
    Ok(())
}
