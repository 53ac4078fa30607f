//! Central path resolution for all DispatchSim data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `DISPATCHSIM_DATA_DIR` env > `~/.dispatchsim`.
//! (clap folds the first two together.)

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".dispatchsim")
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_data_dir);

    if let Ok(mut guard) = DATA_DIR.write() {
        *guard = Some(dir.clone());
    }
    dir
}

/// The data directory chosen at startup (or the default, before init).
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .ok()
        .and_then(|guard| guard.clone())
        .unwrap_or_else(default_data_dir)
}

pub fn db_path() -> PathBuf {
    data_dir().join("dispatchsim.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn catalog_override_path() -> PathBuf {
    data_dir().join("scenarios.json")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
