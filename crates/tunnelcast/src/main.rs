//! `tunnelcast`
//!
//! Launches the dashboard, publishes it through a cloudflared tunnel and
//! exits with the dashboard's exit code.

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info};

use tunnelcast::runner;
use tunnelcast_core::config::{ENV_KEYS, LaunchConfig, load_config};
use tunnelcast_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "tunnelcast")]
#[command(version, about = "Publish a local dashboard through a cloudflared tunnel")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TUNNELCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Local dashboard port
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Append logs to this file in addition to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Dashboard command, overriding the configured one
    #[arg(last = true)]
    command: Vec<String>,
}

impl Args {
    fn apply(self, config: &mut LaunchConfig) {
        if let Some(port) = self.port {
            config.dashboard.port = port;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if self.log_json {
            config.log.json = true;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
        if !self.command.is_empty() {
            config.dashboard.command = self.command;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let level = &config.log.level;
    init_tracing(
        &format!("tunnelcast={level},tunnelcast_core={level}"),
        config.log.json,
        config.log.file.as_deref(),
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.dashboard.port,
        command = ?config.dashboard.command,
        site_repo = ?config.publish.repo,
        "tunnelcast starting"
    );
    let overridden: Vec<&str> = ENV_KEYS
        .iter()
        .copied()
        .filter(|key| std::env::var_os(key).is_some())
        .collect();
    debug!(?overridden, "environment overrides present");

    let code = runner::run(config).await?;
    info!(code, "tunnelcast exiting");
    std::process::exit(code);
}
