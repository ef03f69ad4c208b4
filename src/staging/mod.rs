pub mod money;
pub mod records;
pub mod schema;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::AnyConnection;
use tracing::info;

use crate::engine::types::Entity;
use crate::error::Result;
use crate::staging::records::{NormalizeContext, NormalizedBatch};
use crate::staging::schema::{Cell, Row, TargetTable};
use crate::storage::Warehouse;

/// Bind parameters per INSERT statement, below the SQLite and Postgres limits.
const MAX_BIND_PARAMS: usize = 30_000;
/// Rows per INSERT statement regardless of width.
const MAX_ROWS_PER_INSERT: usize = 5_000;

/// Replaces one store's staging tables with a freshly extracted batch.
pub struct StagingWriter {
    warehouse: Warehouse,
    store: String,
    id_prefix: String,
}

impl StagingWriter {
    pub fn new(warehouse: Warehouse, store: impl Into<String>, id_prefix: impl Into<String>) -> Self {
        Self {
            warehouse,
            store: store.into(),
            id_prefix: id_prefix.into(),
        }
    }

    /// Create this store's staging tables if they do not exist yet.
    pub async fn ensure_tables(&self) -> Result<()> {
        let mut conn = self.warehouse.pool().acquire().await?;
        for table in TargetTable::ALL {
            sqlx::query(&table.staging_ddl(&self.store))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Flatten `raw` into rows, truncate the entity's staging tables, insert
    /// the rows and return the batch's high-water mark.
    ///
    /// The batch is decoded before anything is truncated. A failure while
    /// inserting leaves the staging tables partially filled or empty.
    pub async fn load(&self, raw: Vec<Value>, entity: Entity) -> Result<Option<DateTime<Utc>>> {
        let ctx = NormalizeContext {
            id_prefix: self.id_prefix.clone(),
            loaded_at: Utc::now(),
        };
        let record_count = raw.len();
        let batch = records::normalize(entity, raw, &ctx)?;

        self.replace(&batch).await?;

        info!(
            store = %self.store,
            entity = %entity,
            records = record_count,
            high_water_mark = ?batch.high_water_mark,
            "Staged batch"
        );
        Ok(batch.high_water_mark)
    }

    async fn replace(&self, batch: &NormalizedBatch) -> Result<()> {
        let dialect = self.warehouse.dialect();
        let mut conn = self.warehouse.pool().acquire().await?;

        for table in &batch.tables {
            let name = table.table.staging_name(&self.store);
            info!(store = %self.store, table = %name, "Truncating staging table");
            sqlx::query(&dialect.truncate(&name))
                .execute(&mut *conn)
                .await?;
        }

        for table in &batch.tables {
            let name = table.table.staging_name(&self.store);
            insert_rows(&mut conn, &name, table.table.columns(), &table.rows).await?;
            info!(store = %self.store, table = %name, rows = table.rows.len(), "Inserted rows");
        }

        Ok(())
    }
}

fn insert_statement(table: &str, columns: &[&str], row_count: usize) -> String {
    let width = columns.len();
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, columns.join(", "));
    for r in 0..row_count {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for c in 0..width {
            if c > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}", r * width + c + 1));
        }
        sql.push(')');
    }
    sql
}

async fn insert_rows(
    conn: &mut AnyConnection,
    table: &str,
    columns: &[&str],
    rows: &[Row],
) -> Result<()> {
    if rows.is_empty() || columns.is_empty() {
        return Ok(());
    }
    let chunk_size = (MAX_BIND_PARAMS / columns.len()).clamp(1, MAX_ROWS_PER_INSERT);

    for chunk in rows.chunks(chunk_size) {
        let sql = insert_statement(table, columns, chunk.len());
        let mut query = sqlx::query(&sql);
        for cell in chunk.iter().flatten() {
            query = match cell {
                Cell::Text(v) => query.bind(v.clone()),
                Cell::Int(i) => query.bind(*i),
                Cell::Float(f) => query.bind(*f),
            };
        }
        query.execute(&mut *conn).await?;
    }
    Ok(())
}
