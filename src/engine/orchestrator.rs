use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cli::config::{PipelineConfig, StoreConfig};
use crate::engine::types::*;
use crate::error::{PipelineError, Result};
use crate::extract::{ApiConnector, PaginatedExtractor, archive, updated_after};
use crate::merge::MergeExecutor;
use crate::refresh::DashboardRefresh;
use crate::staging::StagingWriter;
use crate::storage::Warehouse;
use crate::storage::watermark::WatermarkStore;

/// Knobs for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub stores: Vec<StoreConfig>,
    pub entities: Vec<Entity>,
    pub max_workers: usize,
    pub min_request_interval: Duration,
    pub task_timeout: Option<Duration>,
    pub queries_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

impl RunSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            stores: config.stores().to_vec(),
            entities: config.entities(),
            max_workers: config.max_workers(),
            min_request_interval: config.min_request_interval(),
            task_timeout: config.task_timeout(),
            queries_dir: config.queries_dir(),
            archive_dir: config.archive_dir(),
        }
    }
}

/// Everything one staging task needs. Shared read-only across tasks.
struct TaskContext {
    settings: RunSettings,
    warehouse: Warehouse,
    watermarks: WatermarkStore,
    connector: Arc<dyn ApiConnector>,
}

/// Drives the two-phase run: parallel staging, then serial merges, then the
/// dashboard refresh.
pub struct Orchestrator {
    settings: RunSettings,
    warehouse: Warehouse,
    connector: Arc<dyn ApiConnector>,
    merger: MergeExecutor,
    refresher: Option<Arc<dyn DashboardRefresh>>,
    skip_refresh: bool,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        warehouse: Warehouse,
        connector: Arc<dyn ApiConnector>,
        merger: MergeExecutor,
    ) -> Self {
        Self {
            settings,
            warehouse,
            connector,
            merger,
            refresher: None,
            skip_refresh: false,
        }
    }

    pub fn with_refresh(mut self, refresher: Arc<dyn DashboardRefresh>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn skip_refresh(mut self, skip: bool) -> Self {
        self.skip_refresh = skip;
        self
    }

    /// Execute one full invocation.
    ///
    /// Task, merge and refresh failures are reported in the returned
    /// [`RunReport`]. Only a run log or staging table that cannot be created
    /// is an error.
    pub async fn run(&self) -> Result<RunReport> {
        let invocation_id = Uuid::new_v4().to_string();
        let watermarks = WatermarkStore::new(self.warehouse.clone(), invocation_id.clone());
        watermarks.ensure_schema().await?;
        for store in &self.settings.stores {
            StagingWriter::new(self.warehouse.clone(), store.name.clone(), store.id_prefix())
                .ensure_tables()
                .await?;
        }

        info!(
            invocation = %invocation_id,
            stores = self.settings.stores.len(),
            entities = self.settings.entities.len(),
            workers = self.settings.max_workers,
            "Starting pipeline run"
        );

        let staging = self.run_staging(&watermarks).await;
        let mut report = RunReport {
            invocation_id,
            staging,
            merges: Vec::new(),
            refresh: RefreshOutcome::Skipped,
        };

        if !report.all_staged() {
            let failed = report
                .staging
                .iter()
                .filter(|s| s.status == StageStatus::StageFailed)
                .count();
            error!(failed_tasks = failed, "✗ Staging incomplete, skipping merges");
            return Ok(report);
        }
        info!("✓ All staging tasks succeeded");

        report.merges = self.run_merges(&watermarks).await;
        report.refresh = self.run_refresh(&report).await;

        if report.succeeded() {
            info!(invocation = %report.invocation_id, "✓ Pipeline run complete");
        } else {
            error!(invocation = %report.invocation_id, "✗ Pipeline run finished with failed merges");
        }
        Ok(report)
    }

    /// Phase 1: every (store, entity) pair on a bounded worker pool.
    async fn run_staging(&self, watermarks: &WatermarkStore) -> Vec<StageResult> {
        info!("Phase 1: staging");
        let ctx = Arc::new(TaskContext {
            settings: self.settings.clone(),
            warehouse: self.warehouse.clone(),
            watermarks: watermarks.clone(),
            connector: self.connector.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));

        let mut handles = Vec::new();
        for store in &self.settings.stores {
            for &entity in &self.settings.entities {
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let store = store.clone();
                let store_name = store.name.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return StageResult {
                                store: store.name.clone(),
                                entity,
                                status: StageStatus::StageFailed,
                                error: Some(e.to_string()),
                            };
                        }
                    };
                    stage_task(&ctx, &store, entity).await
                });
                handles.push((store_name, entity, handle));
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        for (store, entity, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(store = %store, entity = %entity, error = %e, "✗ Staging task panicked");
                    StageResult {
                        store,
                        entity,
                        status: StageStatus::StageFailed,
                        error: Some(format!("task panicked: {}", e)),
                    }
                }
            };
            results.push(result);
        }
        results
    }

    /// Phase 2: one entity at a time. A failed merge never stops the rest.
    async fn run_merges(&self, watermarks: &WatermarkStore) -> Vec<MergeResult> {
        info!("Phase 2: merging");
        let mut results = Vec::with_capacity(self.settings.entities.len());

        for &entity in &self.settings.entities {
            info!(entity = %entity, "Merging");
            let outcome = self.merger.merge(entity).await;

            match watermarks
                .mark_merge_result(entity, outcome.success, outcome.error.as_deref())
                .await
            {
                Ok(updated) => info!(entity = %entity, records = updated, "Recorded merge result"),
                Err(e) => error!(entity = %entity, error = %e, "Failed to record merge result"),
            }

            let status = if outcome.success {
                info!(entity = %entity, "✓ Merged");
                MergeStatus::Merged
            } else {
                error!(
                    entity = %entity,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "✗ Merge failed"
                );
                MergeStatus::MergeFailed
            };
            results.push(MergeResult {
                entity,
                status,
                error: outcome.error,
            });
        }
        results
    }

    async fn run_refresh(&self, report: &RunReport) -> RefreshOutcome {
        if !report.succeeded() {
            warn!("⊘ Dashboard refresh skipped: no complete set of successful merges");
            return RefreshOutcome::Skipped;
        }
        if self.skip_refresh {
            info!("⊘ Dashboard refresh skipped by request");
            return RefreshOutcome::Skipped;
        }
        let Some(refresher) = &self.refresher else {
            info!("⊘ No dashboard configured");
            return RefreshOutcome::Disabled;
        };

        match refresher.trigger().await {
            Ok(()) => {
                info!("✓ Dashboard refresh triggered");
                RefreshOutcome::Triggered
            }
            Err(e) => {
                warn!(error = %e, "Dashboard refresh failed");
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }
}

/// One (store, entity) task. Every failure is recorded and reported here and
/// never escapes to sibling tasks.
async fn stage_task(ctx: &TaskContext, store: &StoreConfig, entity: Entity) -> StageResult {
    let mut result = StageResult {
        store: store.name.clone(),
        entity,
        status: StageStatus::StageFailed,
        error: None,
    };

    let run_id = match ctx.watermarks.begin_run(&store.name, entity).await {
        Ok(id) => id,
        Err(e) => {
            error!(store = %store.name, entity = %entity, error = %e, "✗ Could not open run record");
            result.error = Some(e.to_string());
            return result;
        }
    };
    info!(store = %store.name, entity = %entity, run_id = %run_id, "Staging task started");

    let work = stage_entity(ctx, store, entity);
    let outcome = match ctx.settings.task_timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(PipelineError::Timeout(limit.as_secs()))),
        None => work.await,
    };

    let outcome = match outcome {
        Ok(mark) => ctx.watermarks.mark_staged(&run_id, mark).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            info!(store = %store.name, entity = %entity, run_id = %run_id, "✓ Staged");
            result.status = StageStatus::Staged;
        }
        Err(e) => {
            error!(store = %store.name, entity = %entity, run_id = %run_id, error = %e, "✗ Staging failed");
            if let Err(log_err) = ctx.watermarks.mark_failed(&run_id, &e.to_string()).await {
                warn!(run_id = %run_id, error = %log_err, "Could not record staging failure");
            }
            result.error = Some(e.to_string());
        }
    }
    result
}

async fn stage_entity(
    ctx: &TaskContext,
    store: &StoreConfig,
    entity: Entity,
) -> Result<Option<DateTime<Utc>>> {
    let filter = match entity.mode() {
        ExtractionMode::Incremental => {
            let start = ctx.watermarks.get_start_date(&store.name, entity).await?;
            info!(store = %store.name, entity = %entity, since = %start, "Incremental extraction");
            Some(updated_after(&start))
        }
        ExtractionMode::Full => {
            info!(store = %store.name, entity = %entity, "Full extraction");
            None
        }
    };

    let template = load_query(&ctx.settings.queries_dir, entity).await?;
    let api = ctx.connector.connect(store)?;
    let mut extractor = PaginatedExtractor::new(api, format!("{}/{}", store.name, entity))
        .with_min_interval(ctx.settings.min_request_interval);
    let records = extractor
        .fetch_all(&template, entity.resource_name(), filter.as_deref())
        .await?;

    if let Some(dir) = &ctx.settings.archive_dir {
        archive::write_batch(dir, &store.name, entity, &records).await?;
    }

    StagingWriter::new(ctx.warehouse.clone(), store.name.clone(), store.id_prefix())
        .load(records, entity)
        .await
}

async fn load_query(dir: &Path, entity: Entity) -> Result<String> {
    let path = dir.join(format!("{}.graphql", entity));
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        PipelineError::Config(format!("query template {}: {}", path.display(), e))
    })
}
