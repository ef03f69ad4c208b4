pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use crate::cli::config::PipelineConfig;
use crate::engine::types::{RefreshOutcome, RunReport, StageStatus};
use crate::engine::{Orchestrator, RunSettings};
use crate::extract::shopify::ShopifyConnector;
use crate::merge::MergeExecutor;
use crate::refresh::{DashboardRefresh, PowerBiRefresh};
use crate::staging::StagingWriter;
use crate::storage::Warehouse;
use crate::storage::watermark::WatermarkStore;

#[derive(Parser)]
#[command(
    name = "shopetl",
    version,
    about = "Daily Shopify-to-warehouse ETL"
)]
pub struct Cli {
    /// Path to a shopetl.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline: stage, merge, refresh (default)
    Run {
        /// Do not trigger the dashboard refresh
        #[arg(long)]
        skip_refresh: bool,
    },

    /// Check that the warehouse is reachable
    Smoke,

    /// Create the run log and staging tables
    InitDb,

    /// Show the next extraction window per store and entity
    Watermarks,

    /// List recent run records
    Runs {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Trigger the dashboard refresh on its own
    Refresh,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env before reading config so secrets can be filled in
    load_dotenv(cli.dotenv.as_deref());

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    config.apply_env();

    match cli.command.unwrap_or(Commands::Run {
        skip_refresh: false,
    }) {
        Commands::Run { skip_refresh } => cmd_run(&config, skip_refresh).await,
        Commands::Smoke => cmd_smoke(&config).await,
        Commands::InitDb => cmd_init_db(&config).await,
        Commands::Watermarks => cmd_watermarks(&config).await,
        Commands::Runs { limit, format } => cmd_runs(&config, limit, format).await,
        Commands::Refresh => cmd_refresh(&config).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn connect(config: &PipelineConfig) -> Result<Warehouse> {
    let url = config.database_url()?;
    Warehouse::connect(url, config.max_connections())
        .await
        .context("Failed to connect to the warehouse")
}

fn build_refresher(config: &PipelineConfig) -> Result<Option<Arc<dyn DashboardRefresh>>> {
    match &config.dashboard {
        Some(dashboard) => {
            let refresher = PowerBiRefresh::new(dashboard)
                .context("Invalid dashboard configuration")?;
            Ok(Some(Arc::new(refresher)))
        }
        None => Ok(None),
    }
}

async fn cmd_run(config: &PipelineConfig, skip_refresh: bool) -> Result<()> {
    if config.stores().is_empty() {
        anyhow::bail!("No stores configured");
    }
    if config.entities().is_empty() {
        anyhow::bail!("No entities configured");
    }

    let warehouse = connect(config).await?;
    let connector = ShopifyConnector {
        api_version: config.api_version().to_string(),
        base_url: config.api_base_url.clone(),
        ..Default::default()
    };
    let merger = MergeExecutor::new(
        warehouse.clone(),
        config.merge.clone(),
        config.store_names(),
    );

    let mut orchestrator = Orchestrator::new(
        RunSettings::from_config(config),
        warehouse.clone(),
        Arc::new(connector),
        merger,
    )
    .skip_refresh(skip_refresh);
    if let Some(refresher) = build_refresher(config)? {
        orchestrator = orchestrator.with_refresh(refresher);
    }

    let report = orchestrator.run().await?;
    warehouse.close().await;

    print_report(&report);
    if !report.succeeded() {
        anyhow::bail!("Pipeline run {} failed", report.invocation_id);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run: {}", report.invocation_id);
    println!("\nStaging:");
    for task in &report.staging {
        let symbol = match task.status {
            StageStatus::Staged => "✓",
            StageStatus::StageFailed => "✗",
        };
        match &task.error {
            Some(e) => println!("  {} {}/{}: {}", symbol, task.store, task.entity, e),
            None => println!("  {} {}/{}", symbol, task.store, task.entity),
        }
    }

    println!("\nMerges:");
    if report.merges.is_empty() {
        println!("  ⊘ skipped");
    }
    for merge in &report.merges {
        match &merge.error {
            Some(e) => println!("  ✗ {}: {}", merge.entity, e),
            None => println!("  ✓ {}", merge.entity),
        }
    }

    let refresh = match &report.refresh {
        RefreshOutcome::Triggered => "✓ triggered".to_string(),
        RefreshOutcome::Failed(e) => format!("✗ failed: {}", e),
        RefreshOutcome::Skipped => "⊘ skipped".to_string(),
        RefreshOutcome::Disabled => "⊘ not configured".to_string(),
    };
    println!("\nDashboard refresh: {}", refresh);
}

async fn cmd_smoke(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect(config).await?;
    warehouse.ping().await.context("Warehouse smoke test failed")?;
    warehouse.close().await;
    println!("✓ Warehouse reachable");
    Ok(())
}

async fn cmd_init_db(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect(config).await?;
    WatermarkStore::new(warehouse.clone(), Uuid::new_v4().to_string())
        .ensure_schema()
        .await
        .context("Failed to create run log")?;
    for store in config.stores() {
        StagingWriter::new(warehouse.clone(), store.name.clone(), store.id_prefix())
            .ensure_tables()
            .await
            .with_context(|| format!("Failed to create staging tables for {}", store.name))?;
    }
    warehouse.close().await;
    println!("✓ Run log and staging tables ready");
    Ok(())
}

async fn cmd_watermarks(config: &PipelineConfig) -> Result<()> {
    let warehouse = connect(config).await?;
    let store = WatermarkStore::new(warehouse.clone(), Uuid::new_v4().to_string());
    store.ensure_schema().await?;

    println!(
        "{:<14} {:<12} {:<28} {:<28}",
        "STORE", "ENTITY", "LAST MARK", "NEXT START"
    );
    println!("{}", "-".repeat(84));

    for s in config.stores() {
        for entity in config.entities() {
            let mark = store.last_success_mark(&s.name, entity).await?;
            let start = store.get_start_date(&s.name, entity).await?;
            let mark = mark
                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<14} {:<12} {:<28} {:<28}",
                s.name,
                entity,
                mark,
                start.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    warehouse.close().await;
    Ok(())
}

async fn cmd_runs(config: &PipelineConfig, limit: i64, format: String) -> Result<()> {
    let warehouse = connect(config).await?;
    let store = WatermarkStore::new(warehouse.clone(), Uuid::new_v4().to_string());
    store.ensure_schema().await?;
    let runs = store.recent_runs(limit).await?;
    warehouse.close().await;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<10} {:<8} {:<7} {:<7} {:<20}",
        "RUN ID", "STORE", "ENTITY", "STATUS", "STAGED", "MERGED", "INGESTED"
    );
    println!("{}", "-".repeat(108));

    for run in &runs {
        let merged = match run.merge_success {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        println!(
            "{:<38} {:<12} {:<10} {:<8} {:<7} {:<7} {:<20}",
            run.id,
            run.store,
            run.entity,
            run.status,
            if run.staging_success { "yes" } else { "no" },
            merged,
            run.ingested_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} record(s)", runs.len());
    Ok(())
}

async fn cmd_refresh(config: &PipelineConfig) -> Result<()> {
    let Some(refresher) = build_refresher(config)? else {
        anyhow::bail!("No dashboard configured: set dashboard.dataset_id or DATASET_ID");
    };
    refresher
        .trigger()
        .await
        .context("Dashboard refresh failed")?;
    println!("✓ Dashboard refresh triggered");
    Ok(())
}
