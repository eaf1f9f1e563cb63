use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use outlierwatch::config::{Config, CONFIG_ENV};

#[derive(Parser)]
#[command(
    name = "outlierwatch",
    about = "Per-service anomaly detection and alerting for request metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + publisher)
    Serve {
        /// Bind address, overriding the configuration
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one training pass over all active services
    Train,

    /// Show per-service detection modes
    Status,

    /// Run one detection pass and publish any alerts
    Detect {
        /// Limit detection to a single service
        #[arg(long)]
        service: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    outlierwatch::init_logging(&config.logging)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting outlierwatch daemon");
            outlierwatch::serve(config).await?;
        }
        Commands::Train => {
            let components = outlierwatch::build(&config).await?;
            let result = components.orchestrator.train_all().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Status => {
            let components = outlierwatch::build(&config).await?;
            let status = components.orchestrator.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Detect { service } => {
            let components = outlierwatch::build(&config).await?;
            outlierwatch::connect_publisher(&components.publisher, false).await?;

            let anomalies = components.orchestrator.detect_all(service.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&anomalies)?);

            if components.publisher.pending() > 0 {
                tracing::warn!(
                    pending = components.publisher.pending(),
                    "broker unavailable, buffered alerts were not delivered"
                );
            }
            components.publisher.shutdown().await;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
