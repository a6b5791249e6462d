//! `kaji watch`: run the sync lifecycle against the configured team until ctrl-c.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use colored::Colorize;
use tokio::sync::watch;

use kaji_core::CacheRegion;
use kaji_sync::{
    CacheInvalidator, StreamStatus, SyncController, SyncSettings, TokenStore, UreqTransport,
};

use super::{load_config, runtime};

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Skip the event stream; only log catch-up refreshes.
    #[arg(long)]
    pub no_stream: bool,
}

/// Prints each refresh the engine asks for instead of refetching anything.
struct LoggingInvalidator;

#[async_trait]
impl CacheInvalidator for LoggingInvalidator {
    async fn invalidate(&self, region: CacheRegion) {
        println!("{} refresh {}", timestamp(), region.key().cyan());
    }

    async fn invalidate_all(&self) {
        println!("{} refresh {}", timestamp(), "everything".yellow().bold());
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string().dimmed().to_string()
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        let config = load_config()?;
        if config.session_token.is_none() {
            bail!("no session_token in ~/.kaji/config.yaml; sign in and paste the session cookie value there");
        }

        let mut settings = SyncSettings::from(&config);
        settings.streaming &= !self.no_stream;
        let transport = Arc::new(UreqTransport::new(&config));

        runtime()?.block_on(async move {
            let mut controller = SyncController::new(
                settings,
                transport,
                Arc::new(LoggingInvalidator),
                TokenStore::new(),
            );
            controller.set_authenticated(true).await;
            println!("Watching {} (ctrl-c to stop)", config.base_url());

            let mut updates = controller.subscribe_status();
            if let Some(rx) = updates.as_mut() {
                print_status(*rx.borrow_and_update());
            }
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            let outcome = loop {
                let update = tokio::select! {
                    signal = &mut ctrl_c => break signal.context("failed to listen for ctrl-c"),
                    update = next_status(&mut updates) => update,
                };
                match update {
                    Some(status) => print_status(status),
                    // Stream task gone; keep waiting for ctrl-c.
                    None => updates = None,
                }
            };

            controller.stop().await;
            println!("Stopped.");
            outcome
        })
    }
}

/// Next published status, `None` once the sender is gone. Never resolves
/// without a subscription.
async fn next_status(updates: &mut Option<watch::Receiver<StreamStatus>>) -> Option<StreamStatus> {
    match updates {
        Some(rx) => {
            rx.changed().await.ok()?;
            Some(*rx.borrow_and_update())
        }
        None => std::future::pending().await,
    }
}

fn print_status(status: StreamStatus) {
    let revision = match status.last_seen {
        0 => "unknown".to_string(),
        n => n.to_string(),
    };
    println!(
        "{} stream {} (revision {})",
        timestamp(),
        status.state.to_string().bold(),
        revision
    );
}
