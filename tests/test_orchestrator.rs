mod common;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use shopetl::cli::config::StoreConfig;
use shopetl::engine::types::*;
use shopetl::engine::{Orchestrator, RunSettings};
use shopetl::error::{PipelineError, Result};
use shopetl::extract::{ApiConnector, RemoteApi};
use shopetl::merge::{MergeExecutor, MergeJob, MergePlan};
use shopetl::refresh::DashboardRefresh;
use shopetl::storage::Warehouse;
use shopetl::storage::watermark::WatermarkStore;
use tempfile::TempDir;

use common::{count, temp_warehouse, write_file};

// --- Fakes ---

#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    max: AtomicUsize,
}

/// Serves one page per entity. The query template text is the entity name.
struct FakeShop {
    store: String,
    fail: Option<(String, String)>,
    delay: Duration,
    concurrency: Arc<Concurrency>,
}

fn node_for(store: &str, entity: &str) -> Value {
    let id = if store == "retail" { 1 } else { 2 };
    match entity {
        "orders" => json!({
            "id": format!("gid://shopify/Order/{}", id),
            "updatedAt": "2025-06-01T10:00:00Z",
            "lineItems": { "edges": [{ "node": { "id": format!("gid://shopify/LineItem/{}", id), "quantity": 1 } }] }
        }),
        "customers" => json!({
            "id": format!("gid://shopify/Customer/{}", id),
            "updatedAt": "2025-06-01T11:00:00Z"
        }),
        _ => json!({
            "id": format!("gid://shopify/Product/{}", id),
            "updatedAt": "2025-06-01T12:00:00Z",
            "variants": { "edges": [] }
        }),
    }
}

#[async_trait]
impl RemoteApi for FakeShop {
    async fn execute(&self, query: &str, _variables: &Value) -> Result<Value> {
        let entity = query.trim();
        let now = self.concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.concurrency.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.concurrency.current.fetch_sub(1, Ordering::SeqCst);

        if self
            .fail
            .as_ref()
            .is_some_and(|(s, e)| s == &self.store && e == entity)
        {
            return Err(PipelineError::Transport("connection reset by peer".to_string()));
        }
        let mut data = serde_json::Map::new();
        data.insert(
            entity.to_string(),
            json!({
                "edges": [{ "node": node_for(&self.store, entity) }],
                "pageInfo": { "hasNextPage": false, "endCursor": null }
            }),
        );
        Ok(json!({ "data": data }))
    }
}

#[derive(Default)]
struct FakeConnector {
    fail: Option<(String, String)>,
    delay: Duration,
    concurrency: Arc<Concurrency>,
}

impl ApiConnector for FakeConnector {
    fn connect(&self, store: &StoreConfig) -> Result<Box<dyn RemoteApi>> {
        Ok(Box::new(FakeShop {
            store: store.name.clone(),
            fail: self.fail.clone(),
            delay: self.delay,
            concurrency: self.concurrency.clone(),
        }))
    }
}

#[derive(Default)]
struct FakeDashboard {
    calls: AtomicUsize,
    reject: bool,
}

#[async_trait]
impl DashboardRefresh for FakeDashboard {
    async fn trigger(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(PipelineError::Refresh("refresh returned status 401".to_string()));
        }
        Ok(())
    }
}

// --- Helpers ---

struct Harness {
    dir: TempDir,
    warehouse: Warehouse,
}

async fn harness() -> Harness {
    let (dir, warehouse) = temp_warehouse().await;
    let root = dir.path();
    std::fs::create_dir_all(root.join("queries")).unwrap();
    std::fs::create_dir_all(root.join("sql")).unwrap();
    for entity in Entity::ALL {
        write_file(&root.join("queries"), &format!("{}.graphql", entity), entity.as_str());
    }

    for sql in [
        "CREATE TABLE merged_orders (order_id TEXT)",
        "CREATE TABLE merged_customers (customer_id TEXT)",
        "CREATE TABLE merged_products (product_id TEXT)",
    ] {
        sqlx::query(sql).execute(warehouse.pool()).await.unwrap();
    }
    write_file(
        &root.join("sql"),
        "merge.sql",
        "INSERT INTO {TARGET_TABLE} ({COLUMNS}) SELECT {COLUMNS} FROM {STAGING_TABLE} s;",
    );
    write_file(
        &root.join("sql"),
        "broken.sql",
        "INSERT INTO {TARGET_TABLE} (no_such_column) SELECT 1;",
    );

    Harness { dir, warehouse }
}

fn merge_plan(root: &Path, broken_products: bool) -> MergePlan {
    let job = |file: &str, target: &str, column: &str, table: &str| MergeJob {
        sql_file: file.to_string(),
        target_table: target.to_string(),
        columns: vec![column.to_string()],
        staging: BTreeMap::from([
            ("retail".to_string(), format!("staging_retail_{}", table)),
            ("wholesale".to_string(), format!("staging_wholesale_{}", table)),
        ]),
        placeholders: BTreeMap::new(),
    };
    let products_file = if broken_products { "broken.sql" } else { "merge.sql" };
    MergePlan {
        sql_dir: Some(root.join("sql").to_string_lossy().to_string()),
        entities: HashMap::from([
            (
                "orders".to_string(),
                vec![job("merge.sql", "merged_orders", "order_id", "fact_orders")],
            ),
            (
                "customers".to_string(),
                vec![job("merge.sql", "merged_customers", "customer_id", "dim_customers")],
            ),
            (
                "products".to_string(),
                vec![job(products_file, "merged_products", "product_id", "dim_products")],
            ),
        ]),
    }
}

fn settings(root: &Path, max_workers: usize) -> RunSettings {
    RunSettings {
        stores: vec![StoreConfig::named("retail"), StoreConfig::named("wholesale")],
        entities: Entity::ALL.to_vec(),
        max_workers,
        min_request_interval: Duration::ZERO,
        task_timeout: None,
        queries_dir: root.join("queries"),
        archive_dir: None,
    }
}

fn orchestrator(
    h: &Harness,
    settings: RunSettings,
    connector: FakeConnector,
    broken_products: bool,
) -> Orchestrator {
    let merger = MergeExecutor::new(
        h.warehouse.clone(),
        merge_plan(h.dir.path(), broken_products),
        vec!["retail".to_string(), "wholesale".to_string()],
    );
    Orchestrator::new(settings, h.warehouse.clone(), Arc::new(connector), merger)
}

async fn records(h: &Harness, report: &RunReport) -> Vec<RunRecord> {
    WatermarkStore::new(h.warehouse.clone(), report.invocation_id.clone())
        .invocation_runs()
        .await
        .unwrap()
}

// ==================== scenarios ====================

#[tokio::test]
async fn one_failed_merge_skips_refresh_but_not_other_merges() {
    let h = harness().await;
    let dashboard = Arc::new(FakeDashboard::default());
    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), true)
        .with_refresh(dashboard.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.staging.len(), 6);
    assert!(report.all_staged());
    assert_eq!(report.merge_status(Entity::Orders), Some(&MergeStatus::Merged));
    assert_eq!(report.merge_status(Entity::Customers), Some(&MergeStatus::Merged));
    assert_eq!(report.merge_status(Entity::Products), Some(&MergeStatus::MergeFailed));
    assert_eq!(report.refresh, RefreshOutcome::Skipped);
    assert_eq!(dashboard.calls.load(Ordering::SeqCst), 0);
    assert!(!report.succeeded());

    assert_eq!(count(&h.warehouse, "merged_orders").await, 2);
    assert_eq!(count(&h.warehouse, "merged_customers").await, 2);
    assert_eq!(count(&h.warehouse, "merged_products").await, 0);

    for record in records(&h, &report).await {
        assert!(record.staging_success);
        if record.entity == "products" {
            assert_eq!(record.status, RunStatus::Failed);
            assert_eq!(record.merge_success, Some(false));
            assert!(record.notes.is_some());
        } else {
            assert_eq!(record.status, RunStatus::Success);
            assert_eq!(record.merge_success, Some(true));
            assert!(record.source_updated_at.is_some());
        }
    }
}

#[tokio::test]
async fn one_failed_task_skips_every_merge() {
    let h = harness().await;
    let dashboard = Arc::new(FakeDashboard::default());
    let connector = FakeConnector {
        fail: Some(("wholesale".to_string(), "customers".to_string())),
        ..Default::default()
    };
    let report = orchestrator(&h, settings(h.dir.path(), 4), connector, false)
        .with_refresh(dashboard.clone())
        .run()
        .await
        .unwrap();

    let failed: Vec<&StageResult> = report
        .staging
        .iter()
        .filter(|s| s.status == StageStatus::StageFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].store, "wholesale");
    assert_eq!(failed[0].entity, Entity::Customers);
    assert!(failed[0].error.as_deref().unwrap().contains("connection reset"));

    assert!(report.merges.is_empty());
    assert_eq!(report.refresh, RefreshOutcome::Skipped);
    assert_eq!(dashboard.calls.load(Ordering::SeqCst), 0);
    assert_eq!(count(&h.warehouse, "merged_orders").await, 0);

    let records = records(&h, &report).await;
    assert_eq!(records.len(), 6);
    for record in &records {
        assert_eq!(record.merge_success, None);
        if record.store == "wholesale" && record.entity == "customers" {
            assert_eq!(record.status, RunStatus::Failed);
            assert!(!record.staging_success);
        } else {
            assert!(record.staging_success);
        }
    }
}

#[tokio::test]
async fn full_success_triggers_refresh_once() {
    let h = harness().await;
    let dashboard = Arc::new(FakeDashboard::default());
    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), false)
        .with_refresh(dashboard.clone())
        .run()
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.refresh, RefreshOutcome::Triggered);
    assert_eq!(dashboard.calls.load(Ordering::SeqCst), 1);
    assert_eq!(count(&h.warehouse, "merged_products").await, 2);

    // The next run starts from the recorded high-water marks
    let marks = WatermarkStore::new(h.warehouse.clone(), "next");
    let mark = marks
        .last_success_mark("retail", Entity::Orders)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mark.to_rfc3339(), "2025-06-01T10:00:00+00:00");
}

#[tokio::test]
async fn refresh_failure_does_not_fail_the_run() {
    let h = harness().await;
    let dashboard = Arc::new(FakeDashboard {
        reject: true,
        ..Default::default()
    });
    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), false)
        .with_refresh(dashboard)
        .run()
        .await
        .unwrap();

    assert!(report.succeeded());
    assert!(matches!(report.refresh, RefreshOutcome::Failed(ref m) if m.contains("401")));
}

#[tokio::test]
async fn refresh_disabled_or_skipped_on_request() {
    let h = harness().await;
    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), false)
        .run()
        .await
        .unwrap();
    assert_eq!(report.refresh, RefreshOutcome::Disabled);

    let dashboard = Arc::new(FakeDashboard::default());
    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), false)
        .with_refresh(dashboard.clone())
        .skip_refresh(true)
        .run()
        .await
        .unwrap();
    assert_eq!(report.refresh, RefreshOutcome::Skipped);
    assert_eq!(dashboard.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_entity_list_never_refreshes() {
    let h = harness().await;
    let dashboard = Arc::new(FakeDashboard::default());
    let mut run_settings = settings(h.dir.path(), 4);
    run_settings.entities.clear();

    let report = orchestrator(&h, run_settings, FakeConnector::default(), false)
        .with_refresh(dashboard.clone())
        .run()
        .await
        .unwrap();

    assert!(report.staging.is_empty());
    assert!(report.merges.is_empty());
    assert!(!report.succeeded());
    assert_eq!(report.refresh, RefreshOutcome::Skipped);
    assert_eq!(dashboard.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let h = harness().await;
    let concurrency = Arc::new(Concurrency::default());
    let connector = FakeConnector {
        delay: Duration::from_millis(50),
        concurrency: concurrency.clone(),
        ..Default::default()
    };
    let report = orchestrator(&h, settings(h.dir.path(), 2), connector, false)
        .run()
        .await
        .unwrap();

    assert!(report.all_staged());
    assert!(concurrency.max.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn slow_task_times_out() {
    let h = harness().await;
    let mut settings = settings(h.dir.path(), 6);
    settings.task_timeout = Some(Duration::from_millis(50));
    let connector = FakeConnector {
        delay: Duration::from_secs(2),
        ..Default::default()
    };
    let report = orchestrator(&h, settings, connector, false)
        .run()
        .await
        .unwrap();

    assert!(report.staging.iter().all(|s| s.status == StageStatus::StageFailed));
    assert!(report.staging[0].error.as_deref().unwrap().contains("timed out"));
    assert!(report.merges.is_empty());
}

#[tokio::test]
async fn missing_query_template_fails_the_task() {
    let h = harness().await;
    std::fs::remove_file(h.dir.path().join("queries").join("products.graphql")).unwrap();

    let report = orchestrator(&h, settings(h.dir.path(), 4), FakeConnector::default(), false)
        .run()
        .await
        .unwrap();

    let failed: Vec<_> = report
        .staging
        .iter()
        .filter(|s| s.status == StageStatus::StageFailed)
        .map(|s| s.entity)
        .collect();
    assert_eq!(failed, vec![Entity::Products, Entity::Products]);
    assert!(report.merges.is_empty());
}

#[tokio::test]
async fn archive_dir_receives_raw_batches() {
    let h = harness().await;
    let archive = h.dir.path().join("raw");
    let mut settings = settings(h.dir.path(), 4);
    settings.archive_dir = Some(archive.clone());

    let report = orchestrator(&h, settings, FakeConnector::default(), false)
        .run()
        .await
        .unwrap();

    assert!(report.all_staged());
    let retail_files = std::fs::read_dir(archive.join("retail")).unwrap().count();
    let wholesale_files = std::fs::read_dir(archive.join("wholesale")).unwrap().count();
    assert_eq!(retail_files, 3);
    assert_eq!(wholesale_files, 3);
}
