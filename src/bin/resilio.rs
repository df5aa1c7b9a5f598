//! resilio: operator tool for the resilience layer configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use resilio::{Config, LogFormat, LoggingConfig};

/// Inspect and validate resilience layer configuration.
#[derive(Parser)]
#[command(name = "resilio")]
#[command(version = resilio::PKG_VERSION)]
#[command(about = "Resilience layer configuration tool")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, global = true, env = "RESILIO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print it as JSON.
    Check,
    /// Print the default configuration as TOML.
    Defaults,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Defaults => {
            print!("{}", Config::default().to_toml_string()?);
        }
        Command::Check => {
            let config = Config::load_or_default(args.config.as_deref())?;
            init_tracing(&config.logging);
            info!(
                version = resilio::PKG_VERSION,
                cache_ttl_secs = config.cache.ttl_secs,
                cache_max_entries = config.cache.max_entries,
                pool_min_idle = config.pool.min_idle,
                pool_max_size = config.pool.max_size,
                window_secs = config.rate_limit.window_secs,
                routes = config.rate_limit.routes.len(),
                "configuration is valid"
            );
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `[logging].level`.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
    }
}
