use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdr_core::MergeRequest;
use mdr_service::{
    connect_store, load_seed_file, seed_store, MergeService, QueryService, ServiceConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mdr-cli")]
#[command(about = "Merchant duplicate review and merge tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List candidate pairs that still await a merge decision.
    Pairs,
    /// Deactivate `discard` in favor of `keep`.
    Merge {
        #[arg(long)]
        keep: String,
        #[arg(long)]
        discard: String,
    },
    /// Print recorded merges, oldest first.
    History,
    /// Load merchants and candidate pairs from a JSON fixture.
    Seed { path: PathBuf },
    Migrate,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "mdr=info".into());
    let json = std::env::var("MDR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command {
        Commands::Pairs => {
            let store = Arc::new(connect_store(&config).await?);
            let pairs = QueryService::new(store)
                .list_unresolved_pairs()
                .await
                .context("listing unresolved pairs")?;
            println!("{}", serde_json::to_string_pretty(&pairs)?);
        }
        Commands::Merge { keep, discard } => {
            let store = Arc::new(connect_store(&config).await?);
            let outcome = MergeService::new(store)
                .merge_merchants(&MergeRequest::new(keep, discard))
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                warn!(message = %outcome.message, "merge not applied");
                return Ok(ExitCode::FAILURE);
            }
            info!(
                keep = %outcome.kept_merchant_id,
                discard = %outcome.discarded_merchant_id,
                "merge applied"
            );
        }
        Commands::History => {
            let store = Arc::new(connect_store(&config).await?);
            let history = QueryService::new(store)
                .list_merge_history()
                .await
                .context("listing merge history")?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Seed { path } => {
            let store = connect_store(&config).await?;
            let fixture = load_seed_file(&path).await?;
            let summary = seed_store(&store, &fixture)
                .await
                .with_context(|| format!("seeding from {}", path.display()))?;
            info!(path = %path.display(), "seed file applied");
            println!(
                "seed complete: merchants={} candidates={}",
                summary.merchants, summary.candidates
            );
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let store = Arc::new(connect_store(&config).await?);
            mdr_web::serve(&config, store).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
