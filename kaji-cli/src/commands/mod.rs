pub mod call;
pub mod config;
pub mod watch;

use std::path::PathBuf;

use anyhow::{Context, Result};

use kaji_core::{config as sync_config, SyncConfig};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn load_config() -> Result<SyncConfig> {
    let home = home_dir()?;
    sync_config::load_at(&home).with_context(|| {
        format!(
            "failed to load {}",
            sync_config::config_path_at(&home).display()
        )
    })
}

/// Single-threaded runtime: the engine's tasks only ever cooperate.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
