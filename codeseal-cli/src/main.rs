//! Codeseal - signs code trees and verifies installations against their signatures

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use codeseal_core::IntegrityConfig;

mod integrity_cli;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "codeseal",
    about = "Sign code trees and verify installations against their signatures",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: integrity_cli::IntegrityCommand,

    /// Configuration file (default: <server root>/config/codeseal.yml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory of the installation
    #[clap(long, global = true)]
    server_root: Option<PathBuf>,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON
    #[clap(long, global = true)]
    json: bool,
}

/// Initialize tracing with CLI flags
///
/// `RUST_LOG` directives are added on top of --log-level. Logs always go to
/// stderr; stdout carries the reports.
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let mut filter = EnvFilter::new(log_level.to_filter_directive());
    if let Ok(extra) = std::env::var("RUST_LOG") {
        for directive in extra.split(',').filter(|d| !d.is_empty()) {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
    }

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Expand a leading `~/` to the home directory
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.json);

    let config_path = cli.config.as_deref().map(expand_home);
    let server_root = cli.server_root.as_deref().map(expand_home);
    let config = IntegrityConfig::discover(config_path.as_deref(), server_root.as_deref())?;

    let passed = cli.command.execute(config).await?;
    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
