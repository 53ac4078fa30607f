use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dispatchsim_transport::DeliveryMode;

use crate::config::Overrides;

#[derive(Parser)]
#[command(name = "dispatchsim")]
#[command(about = "DispatchSim - practice emergency call-taking against a simulated caller")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (defaults to ~/.dispatchsim)
    #[arg(long, global = true, env = "DISPATCHSIM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Simulation API root, e.g. http://localhost:5000/api
    #[arg(long, global = true, env = "DISPATCHSIM_API_URL")]
    pub api_url: Option<String>,

    /// Push channel endpoint, e.g. ws://localhost:5000/ws
    #[arg(long, global = true, env = "DISPATCHSIM_WS_URL")]
    pub ws_url: Option<String>,

    /// Reply delivery: polling (HTTP request/response) or streaming (WebSocket)
    #[arg(long, global = true, env = "DISPATCHSIM_MODE")]
    pub mode: Option<DeliveryMode>,

    /// Trainee identifier that owns sessions and history
    #[arg(long, global = true, env = "DISPATCHSIM_TRAINEE_ID")]
    pub trainee: Option<String>,

    /// Bearer token for the simulation service
    #[arg(long, global = true, env = "DISPATCHSIM_AUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            api_url: self.api_url.clone(),
            ws_url: self.ws_url.clone(),
            mode: self.mode,
            trainee_id: self.trainee.clone(),
            auth_token: self.token.clone(),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Place a new simulated call
    Call {
        /// Scenario code, e.g. 10-11 (see `dispatchsim scenarios`)
        code: String,

        /// Event subtype to request from the scenario
        #[arg(short, long)]
        subtype: Option<String>,

        /// Answer immediately instead of letting the call ring
        #[arg(long)]
        no_ring: bool,
    },

    /// Reattach to an active call, or list active calls when no id is given
    Resume { session_id: Option<String> },

    /// Browse completed calls
    #[command(subcommand)]
    History(HistoryCommand),

    /// List the scenario catalog
    Scenarios {
        /// Only show scenarios of this event type
        #[arg(short, long)]
        event_type: Option<String>,
    },

    /// Show configuration, local storage, and service health
    Status,

    /// Print shell completions
    Completions { shell: Shell },
}

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// Completed calls, newest first
    List,
    /// Full transcript of one call
    Show { session_id: String },
    /// Remove one call from history
    Delete { session_id: String },
    /// Remove all completed calls for the trainee
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Aggregate progress across completed calls
    Stats,
}
