use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::types::Entity;
use crate::error::{PipelineError, Result};
use crate::storage::Warehouse;

/// One SQL template executed as part of an entity's merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeJob {
    /// Template file, relative to the plan's `sql_dir`.
    pub sql_file: String,
    pub target_table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Store name → staging table. Stores are combined in name order.
    #[serde(default)]
    pub staging: BTreeMap<String, String>,
    /// Extra `{KEY}` substitutions, e.g. `STAGING_VARIANT_RETAIL`.
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,
}

/// Entity name → ordered merge jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePlan {
    pub sql_dir: Option<String>,
    pub entities: HashMap<String, Vec<MergeJob>>,
}

impl MergePlan {
    pub fn sql_dir(&self) -> PathBuf {
        PathBuf::from(self.sql_dir.as_deref().unwrap_or("sql"))
    }

    pub fn jobs(&self, entity: Entity) -> &[MergeJob] {
        self.entities
            .get(entity.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Result of one entity merge. Never raised, always returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl MergeOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            error: Some(message),
        }
    }
}

/// `{STAGING_TABLE}` value: one table as-is, several as a UNION ALL subquery.
pub fn combined_staging<S: AsRef<str>>(tables: &[S]) -> String {
    match tables {
        [] => String::new(),
        [single] => single.as_ref().to_string(),
        many => {
            let selects: Vec<String> = many
                .iter()
                .map(|t| format!("SELECT * FROM {}", t.as_ref()))
                .collect();
            format!("({})", selects.join(" UNION ALL "))
        }
    }
}

/// Placeholder values for one job, in substitution order. Every store in
/// `stores` gets a `{STAGING_<STORE>}` value, empty when the job has no
/// staging table for it.
pub fn substitutions(job: &MergeJob, stores: &[String]) -> Vec<(String, String)> {
    let staging_tables: Vec<&String> = job.staging.values().collect();
    let mut subs = vec![
        ("TARGET_TABLE".to_string(), job.target_table.clone()),
        ("STAGING_TABLE".to_string(), combined_staging(&staging_tables)),
        ("COLUMNS".to_string(), job.columns.join(", ")),
    ];
    for (store, table) in &job.staging {
        subs.push((format!("STAGING_{}", store.to_uppercase()), table.clone()));
    }
    for store in stores.iter().filter(|s| !job.staging.contains_key(*s)) {
        subs.push((format!("STAGING_{}", store.to_uppercase()), String::new()));
    }
    for (key, value) in &job.placeholders {
        subs.push((key.clone(), value.clone()));
    }
    subs
}

/// Replace every `{KEY}` token with its value.
pub fn render_sql(template: &str, subs: &[(String, String)]) -> String {
    let mut sql = template.to_string();
    for (key, value) in subs {
        sql = sql.replace(&format!("{{{}}}", key), value);
    }
    sql
}

async fn load_template(sql_dir: &Path, file: &str) -> Result<String> {
    let path = sql_dir.join(file);
    tokio::fs::read_to_string(&path).await.map_err(|e| {
        PipelineError::Merge(format!("SQL file not found: {} ({})", path.display(), e))
    })
}

/// Runs an entity's merge jobs inside one warehouse transaction.
pub struct MergeExecutor {
    warehouse: Warehouse,
    plan: MergePlan,
    stores: Vec<String>,
}

impl MergeExecutor {
    pub fn new(warehouse: Warehouse, plan: MergePlan, stores: Vec<String>) -> Self {
        Self {
            warehouse,
            plan,
            stores,
        }
    }

    /// All jobs commit together or none do.
    pub async fn merge(&self, entity: Entity) -> MergeOutcome {
        match self.try_merge(entity).await {
            Ok(()) => MergeOutcome::ok(),
            Err(e) => MergeOutcome::failed(e.to_string()),
        }
    }

    async fn try_merge(&self, entity: Entity) -> Result<()> {
        let jobs = self.plan.jobs(entity);
        if jobs.is_empty() {
            return Err(PipelineError::Merge(format!(
                "No SQL jobs found for entity: {}",
                entity
            )));
        }

        let sql_dir = self.plan.sql_dir();
        let mut statements = Vec::with_capacity(jobs.len());
        for job in jobs {
            let template = load_template(&sql_dir, &job.sql_file).await?;
            let sql = render_sql(&template, &substitutions(job, &self.stores));
            statements.push((job.sql_file.as_str(), sql));
        }

        let mut tx = self.warehouse.pool().begin().await?;
        for (file, sql) in &statements {
            info!(entity = %entity, sql_file = %file, "Executing merge SQL");
            if let Err(e) = sqlx::raw_sql(sql).execute(&mut *tx).await {
                error!(entity = %entity, sql_file = %file, error = %e, "Merge SQL failed, rolling back");
                if let Err(rb) = tx.rollback().await {
                    warn!(entity = %entity, error = %rb, "Rollback failed");
                }
                return Err(PipelineError::Merge(format!("{}: {}", file, e)));
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
