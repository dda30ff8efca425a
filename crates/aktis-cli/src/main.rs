use std::path::PathBuf;
use std::sync::Arc;

use aktis_storage::Partition;
use aktis_sync::{fetch_many, IndexSynchronizer, ItemPaginator, ServiceConfig, Services};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_TARGETS: [&str; 6] = [
    "aktis",
    "aktis_core",
    "aktis_storage",
    "aktis_sources",
    "aktis_sync",
    "aktis_web",
];

#[derive(Debug, Parser)]
#[command(name = "aktis")]
#[command(about = "Local Jira and Confluence collector")]
#[command(version)]
struct Cli {
    /// TOML config file; defaults to ./aktis.toml or ./config.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve,
    /// Rebuild the project index with issue counts
    SyncProjects,
    /// Rebuild the space index with page counts
    SyncSpaces,
    /// Fetch all issues for the given projects
    FetchIssues {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Fetch all pages for the given spaces
    FetchPages {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove all cached projects, issues, spaces and pages
    Clear,
}

fn init_tracing(level: &str) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives: Vec<String> = LOG_TARGETS.iter().map(|t| format!("{t}={level}")).collect();
            EnvFilter::new(format!("warn,{}", directives.join(",")))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

async fn require_auth(services: &Services) -> Result<()> {
    if !services.auth.is_authenticated().await {
        bail!("no stored credentials; start `aktis serve` and authenticate through the extension first");
    }
    Ok(())
}

async fn run_index_sync<E>(services: &Services, engine: Arc<E>) -> Result<()>
where
    E: IndexSynchronizer + 'static,
{
    require_auth(services).await?;
    let summary = engine.sync_index().await?;
    services.store.flush()?;
    println!(
        "{} index synced: run_id={} containers={} counted={} unknown={}",
        summary.kind, summary.run_id, summary.containers, summary.counted, summary.unknown
    );
    Ok(())
}

async fn run_item_fetch<P>(services: &Services, engine: Arc<P>, keys: Vec<String>) -> Result<()>
where
    P: ItemPaginator + 'static,
{
    require_auth(services).await?;
    let mut failed = 0usize;
    for (key, result) in fetch_many(engine, keys).await {
        match result {
            Ok(s) => println!(
                "{key}: stored={} duplicates={} misrouted={} skipped={} requests={} stop={:?}",
                s.stored, s.duplicates, s.misrouted, s.skipped, s.requests, s.stop_reason
            ),
            Err(err) => {
                failed += 1;
                eprintln!("{key}: failed: {err}");
            }
        }
    }
    services.store.flush()?;
    if failed > 0 {
        bail!("{failed} container fetch(es) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = ServiceConfig::load(cli.config.as_deref())?;
    init_tracing(&loaded.config.logging.level);
    match &loaded.path {
        Some(path) => info!(path = %path.display(), "loaded config"),
        None => info!("no config file found; using defaults"),
    }
    for note in &loaded.ignored {
        warn!("{note}");
    }
    let config = loaded.config;

    let services = Services::open(&config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            aktis_web::serve(services.clone(), &config.bind_addr()).await?;
            services.store.flush()?;
        }
        Commands::SyncProjects => {
            let engine = Arc::clone(&services.jira);
            run_index_sync(&services, engine).await?;
        }
        Commands::SyncSpaces => {
            let engine = Arc::clone(&services.confluence);
            run_index_sync(&services, engine).await?;
        }
        Commands::FetchIssues { keys } => {
            let engine = Arc::clone(&services.jira);
            run_item_fetch(&services, engine, keys).await?;
        }
        Commands::FetchPages { keys } => {
            let engine = Arc::clone(&services.confluence);
            run_item_fetch(&services, engine, keys).await?;
        }
        Commands::Clear => {
            let mut removed = 0usize;
            for partition in Partition::DATA {
                removed += services.store.clear(partition)?;
            }
            services.store.flush()?;
            println!("cleared {removed} cached records; credentials kept");
        }
    }

    Ok(())
}
