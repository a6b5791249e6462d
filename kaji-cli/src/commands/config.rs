//! `kaji config show` and `kaji config init`

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use kaji_core::{config as sync_config, SyncConfig};

use super::{home_dir, load_config};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the resolved configuration (defaults filled in) as YAML.
    Show,

    /// Write a new config file.
    Init(InitArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Base URL of the team API, e.g. https://kaji.example.com
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,

    /// Origin header sent with writes (must match the server's allowed origins).
    #[arg(long)]
    pub origin: Option<String>,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

pub fn run(cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(),
        ConfigCommand::Init(args) => init(args),
    }
}

fn show() -> Result<()> {
    let mut config = load_config()?;
    if config.session_token.is_some() {
        config.session_token = Some("<redacted>".to_string());
    }
    let yaml = serde_yaml::to_string(&config).context("failed to render config")?;
    print!("{yaml}");
    Ok(())
}

fn init(args: InitArgs) -> Result<()> {
    let home = home_dir()?;
    let path = sync_config::config_path_at(&home);
    if path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let mut config = SyncConfig::default();
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    config.origin = args.origin;

    let path = sync_config::save_at(&home, &config)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("{} Wrote {}", "✓".green(), path.display());
    println!("  API: {}", config.base_url());
    if config.session_token.is_none() {
        println!("  Add session_token to sign in.");
    }
    Ok(())
}
