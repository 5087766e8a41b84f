use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use release_catalog::catalog::registries::OciRegistry;
use release_catalog::catalog::registry::Arch;
use release_catalog::catalog::store::Catalog;
use release_catalog::config::{CatalogConfig, LOG_FILE_NAME, data_dir};
use release_catalog::sync::{SyncSettings, Synchronizer};

#[derive(Parser)]
#[command(name = "release-catalog")]
#[command(version, about = "Catalog of published release versions and their official extensions")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Write logs to the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh the release versions and print them
    Versions,
    /// Refresh the official extensions of release tags and print them
    Extensions {
        /// Release tags, e.g. v1.6.0
        #[arg(required = true)]
        tags: Vec<String>,

        /// Architecture of the extension manifest image (defaults to the configured one)
        #[arg(long, value_enum)]
        arch: Option<Arch>,
    },
    /// Refresh versions and the newest release's extensions periodically until interrupted
    Watch,
}

fn init_tracing(json: bool, log_file: bool) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = if log_file {
        let dir = data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {:?}", dir))?;
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE_NAME))
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(!log_file);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.json, cli.log_file)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => CatalogConfig::load(path)?,
        None => CatalogConfig::default(),
    };
    let settings = SyncSettings::from_config(&config)?;

    let registry = Arc::new(OciRegistry::new(&config.registry.base_url));
    let sync = Synchronizer::new(
        registry.clone(),
        registry,
        Arc::new(Catalog::new()),
        settings,
    );

    match cli.command {
        Command::Versions => {
            sync.refresh_versions().await?;
            for version in &sync.versions().versions {
                println!("{}", version);
            }
        }
        Command::Extensions { tags, arch } => {
            let arch = arch.unwrap_or(config.arch);
            let results = sync.refresh_all_extensions(&tags, arch).await;

            let mut failed = 0;
            for (tag, result) in results {
                if result.is_err() {
                    failed += 1;
                    continue;
                }
                for extension in sync.extensions(&tag).iter().flat_map(|list| list.iter()) {
                    println!("{}\t{}", tag, extension);
                }
            }

            if failed > 0 {
                bail!("failed to refresh extensions for {} of {} tags", failed, tags.len());
            }
        }
        Command::Watch => {
            let interval = config.refresh_interval();
            if interval.is_zero() {
                bail!("refreshInterval must be greater than zero");
            }
            watch(&sync, config.arch, interval).await;
        }
    }

    Ok(())
}

/// Refresh on a fixed interval; failures are logged and retried on the next tick
async fn watch(sync: &Synchronizer, arch: Arch, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(?interval, %arch, "Watching registry for catalog changes");

    loop {
        tokio::select! {
            _ = ticker.tick() => refresh_once(sync, arch).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
}

async fn refresh_once(sync: &Synchronizer, arch: Arch) {
    if let Err(e) = sync.refresh_versions().await {
        error!("Failed to refresh versions: {}", e);
    }

    // Release tags carry the usual "v" prefix
    let Some(tag) = sync.versions().latest().map(|version| format!("v{}", version)) else {
        warn!("No release versions cached yet, skipping extensions");
        return;
    };

    if let Err(e) = sync.refresh_extensions(&tag, arch).await {
        error!("Failed to refresh extensions for {}: {}", tag, e);
    }
}
