pub mod watermark;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::info;

use crate::error::{PipelineError, Result};

/// SQL flavour of the warehouse, derived from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(PipelineError::Config(format!(
                "unsupported warehouse URL scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }

    /// Statement that empties a table while keeping its definition.
    pub fn truncate(&self, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("TRUNCATE TABLE {}", table),
            Dialect::Sqlite => format!("DELETE FROM {}", table),
        }
    }
}

/// Handle to the warehouse database.
///
/// Cloning is cheap; every clone shares the same pool. Each logical
/// operation checks a connection out of the pool and returns it when done,
/// so no connection outlives a single operation.
#[derive(Clone)]
pub struct Warehouse {
    pool: AnyPool,
    dialect: Dialect,
}

impl Warehouse {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let dialect = Dialect::from_url(url)?;

        // Install any drivers that are compiled in
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;

        info!(dialect = ?dialect, "Connected to warehouse");
        Ok(Self { pool, dialect })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// `SELECT 1` round trip.
    pub async fn ping(&self) -> Result<()> {
        let value: i64 = sqlx::query_scalar("SELECT CAST(1 AS BIGINT)")
            .fetch_one(&self.pool)
            .await?;
        if value != 1 {
            return Err(PipelineError::Config(format!(
                "SELECT 1 returned unexpected value {}",
                value
            )));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
