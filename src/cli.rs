use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, Platform};
use crate::load_config::load_config;
use crate::notify::DiscordWebhook;
use crate::platforms::default_publishers;
use crate::publish::Pipeline;
use crate::schedule::run_hourly;
use crate::sources::HttpImageSource;

/// CLI for hourly-photos: fetch an animal photo and post it everywhere, every hour.
#[derive(Parser)]
#[clap(
    name = "hourly-photos",
    version,
    about = "Fetch an animal photo every hour and republish it to Twitter, Tumblr and Bluesky"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a cycle at the top of every hour until interrupted
    Run {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Run a single cycle now and print the report
    Once {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Load and validate the config file, then print what would run
    Check {
        /// Path to the YAML config file
        #[clap(long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

/// Wires the real HTTP collaborators around a config store.
pub fn build_pipeline(store: Arc<ConfigStore>, cancel: CancellationToken) -> Result<Pipeline> {
    let timeout = store.snapshot().settings.request_timeout();
    let client = crate::http_client(timeout).context("Failed to build HTTP client")?;
    Ok(Pipeline::new(
        Arc::new(HttpImageSource::new(client.clone())),
        default_publishers(client.clone(), store),
        Arc::new(DiscordWebhook::new(client, cancel.clone())),
        cancel,
    ))
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run { config } => {
            let store = Arc::new(ConfigStore::open(&config)?);
            let pipeline = build_pipeline(store.clone(), cancel.clone())?;
            println!("Posting every hour, press Ctrl+C to stop.");
            run_hourly(&store, &pipeline, &cancel).await;
            Ok(())
        }
        Commands::Once { config } => {
            let store = Arc::new(ConfigStore::open(&config)?);
            let pipeline = build_pipeline(store.clone(), cancel)?;
            let reports = pipeline.run_cycle(&store.snapshot()).await;
            println!("Cycle complete.\nReport:");
            if reports.is_empty() {
                println!("(no source has an enabled platform)");
            }
            for report in &reports {
                println!("{report}");
            }
            Ok(())
        }
        Commands::Check { config } => {
            let config = load_config(&config)?;
            println!("Config OK: {} sources", config.sources.len());
            for source in &config.sources {
                let platforms: Vec<String> = Platform::ALL
                    .iter()
                    .filter(|p| source.platform_enabled(**p))
                    .map(|p| p.to_string())
                    .collect();
                let state = if !source.enabled {
                    "disabled".to_string()
                } else if platforms.is_empty() {
                    "no platforms enabled".to_string()
                } else {
                    platforms.join(", ")
                };
                println!("  {} ({}): {}", source.key, source.name, state);
            }
            Ok(())
        }
    }
}
