use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::any::AnyRow;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::types::{Entity, RunRecord, RunStatus};
use crate::error::{PipelineError, Result};
use crate::storage::Warehouse;

/// Lookback applied on top of the gap since the last high-water mark.
pub const MIN_LOOKBACK_DAYS: i64 = 2;
/// Lookback used when a (store, entity) pair has never succeeded.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 3;

const RUN_LOG_DDL: &str = "CREATE TABLE IF NOT EXISTS etl_run_log (
    id TEXT PRIMARY KEY,
    invocation_id TEXT NOT NULL,
    store_name TEXT NOT NULL,
    entity_name TEXT NOT NULL,
    status TEXT NOT NULL,
    staging_success BIGINT NOT NULL DEFAULT 0,
    merge_success BIGINT,
    source_updated_at TEXT,
    notes TEXT,
    ingested_at TEXT NOT NULL
)";

const RUN_LOG_INDEX: &str = "CREATE INDEX IF NOT EXISTS etl_run_log_lookup \
    ON etl_run_log (store_name, entity_name, status)";

const RUN_COLUMNS: &str = "id, invocation_id, store_name, entity_name, status, staging_success, \
    merge_success, source_updated_at, notes, ingested_at";

/// Days to re-extract given the last successful high-water mark.
///
/// Always overlaps the previous window so a partially failed run cannot
/// leave a gap.
pub fn lookback_days(last_mark: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match last_mark {
        Some(mark) => MIN_LOOKBACK_DAYS + (now - mark).num_days().max(0),
        None => DEFAULT_LOOKBACK_DAYS,
    }
}

/// Text form used for every timestamp in the run log. Fixed width, so the
/// text ordering matches the chronological one.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn flag(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

/// Run log and high-water marks, scoped to one pipeline invocation.
#[derive(Clone)]
pub struct WatermarkStore {
    warehouse: Warehouse,
    invocation_id: String,
}

impl WatermarkStore {
    pub fn new(warehouse: Warehouse, invocation_id: impl Into<String>) -> Self {
        Self {
            warehouse,
            invocation_id: invocation_id.into(),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Create the run log table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.warehouse.pool().acquire().await?;
        sqlx::query(RUN_LOG_DDL).execute(&mut *conn).await?;
        sqlx::query(RUN_LOG_INDEX).execute(&mut *conn).await?;
        Ok(())
    }

    /// High-water mark of the most recent successful run.
    ///
    /// `None` when the pair never succeeded, or when its latest success
    /// staged an empty batch and so recorded no mark.
    pub async fn last_success_mark(
        &self,
        store: &str,
        entity: Entity,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.warehouse.pool().acquire().await?;
        let latest: Option<Option<String>> = sqlx::query_scalar(
            "SELECT source_updated_at FROM etl_run_log \
             WHERE store_name = $1 AND entity_name = $2 AND status = 'SUCCESS' \
             ORDER BY ingested_at DESC, id DESC LIMIT 1",
        )
        .bind(store)
        .bind(entity.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(latest.flatten().and_then(|r| {
            let parsed = parse_ts(&r);
            if parsed.is_none() {
                warn!(store = %store, entity = %entity, value = %r, "Ignoring unparseable high-water mark");
            }
            parsed
        }))
    }

    /// Earliest timestamp to re-extract from, relative to `now`.
    pub async fn start_date_at(
        &self,
        store: &str,
        entity: Entity,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mark = self.last_success_mark(store, entity).await?;
        let days = lookback_days(mark, now);
        debug!(store = %store, entity = %entity, lookback_days = days, "Computed extraction window");
        Ok(now - Duration::days(days))
    }

    pub async fn get_start_date(&self, store: &str, entity: Entity) -> Result<DateTime<Utc>> {
        self.start_date_at(store, entity, Utc::now()).await
    }

    /// Insert a RUNNING record and return its id.
    pub async fn begin_run(&self, store: &str, entity: Entity) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let mut conn = self.warehouse.pool().acquire().await?;
        sqlx::query(
            "INSERT INTO etl_run_log \
             (id, invocation_id, store_name, entity_name, status, staging_success, ingested_at) \
             VALUES ($1, $2, $3, $4, 'RUNNING', 0, $5)",
        )
        .bind(run_id.as_str())
        .bind(self.invocation_id.as_str())
        .bind(store)
        .bind(entity.as_str())
        .bind(format_ts(&Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(run_id)
    }

    /// Record staging success and the batch's high-water mark.
    pub async fn mark_staged(
        &self,
        run_id: &str,
        high_water_mark: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.warehouse.pool().acquire().await?;
        sqlx::query(
            "UPDATE etl_run_log SET staging_success = 1, source_updated_at = $1 \
             WHERE id = $2 AND status = 'RUNNING'",
        )
        .bind(high_water_mark.as_ref().map(format_ts))
        .bind(run_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Terminal failure for one run.
    pub async fn mark_failed(&self, run_id: &str, message: &str) -> Result<()> {
        let mut conn = self.warehouse.pool().acquire().await?;
        sqlx::query(
            "UPDATE etl_run_log SET status = 'FAILED', notes = $1 \
             WHERE id = $2 AND status = 'RUNNING'",
        )
        .bind(message)
        .bind(run_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Stamp the merge outcome on every RUNNING record of `entity` in this
    /// invocation, across all stores. Returns the number of records updated.
    pub async fn mark_merge_result(
        &self,
        entity: Entity,
        success: bool,
        message: Option<&str>,
    ) -> Result<u64> {
        let status = if success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let mut conn = self.warehouse.pool().acquire().await?;
        let result = sqlx::query(
            "UPDATE etl_run_log SET merge_success = $1, status = $2, notes = $3 \
             WHERE entity_name = $4 AND invocation_id = $5 AND status = 'RUNNING'",
        )
        .bind(flag(success))
        .bind(status.as_str())
        .bind(message)
        .bind(entity.as_str())
        .bind(self.invocation_id.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Run records written by this invocation, oldest first.
    pub async fn invocation_runs(&self) -> Result<Vec<RunRecord>> {
        let mut conn = self.warehouse.pool().acquire().await?;
        let sql = format!(
            "SELECT {} FROM etl_run_log WHERE invocation_id = $1 ORDER BY ingested_at, id",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.invocation_id.as_str())
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Latest run records across all invocations, newest first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let mut conn = self.warehouse.pool().acquire().await?;
        let sql = format!(
            "SELECT {} FROM etl_run_log ORDER BY ingested_at DESC LIMIT $1",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &AnyRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    let ingested_raw: String = row.try_get("ingested_at")?;
    let ingested_at = parse_ts(&ingested_raw).ok_or_else(|| {
        PipelineError::Config(format!("invalid ingested_at in run log: {}", ingested_raw))
    })?;
    let staging_success: i64 = row.try_get("staging_success")?;
    let merge_success: Option<i64> = row.try_get("merge_success")?;
    let source_updated_at: Option<String> = row.try_get("source_updated_at")?;

    Ok(RunRecord {
        id: row.try_get("id")?,
        invocation_id: row.try_get("invocation_id")?,
        store: row.try_get("store_name")?,
        entity: row.try_get("entity_name")?,
        status: status.parse()?,
        staging_success: staging_success != 0,
        merge_success: merge_success.map(|v| v != 0),
        source_updated_at: source_updated_at.as_deref().and_then(parse_ts),
        notes: row.try_get("notes")?,
        ingested_at,
    })
}
