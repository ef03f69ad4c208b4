use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// A source entity pulled from every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Orders,
    Customers,
    Products,
}

/// How an entity is pulled from the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Only records updated after the watermark-derived start date.
    Incremental,
    /// Every record, every run.
    Full,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Orders, Entity::Customers, Entity::Products];

    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Orders => "orders",
            Entity::Customers => "customers",
            Entity::Products => "products",
        }
    }

    /// Name of the connection field in the GraphQL response.
    pub fn resource_name(&self) -> &'static str {
        self.as_str()
    }

    pub fn mode(&self) -> ExtractionMode {
        match self {
            Entity::Orders | Entity::Customers => ExtractionMode::Incremental,
            Entity::Products => ExtractionMode::Full,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Entity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orders" => Ok(Entity::Orders),
            "customers" => Ok(Entity::Customers),
            "products" => Ok(Entity::Products),
            other => Err(PipelineError::Config(format!("unknown entity: {}", other))),
        }
    }
}

/// Lifecycle status of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(PipelineError::Config(format!("unknown run status: {}", other))),
        }
    }
}

/// One row of the run log: a (store, entity) attempt within an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub invocation_id: String,
    pub store: String,
    pub entity: String,
    pub status: RunStatus,
    pub staging_success: bool,
    /// `None` until the entity's merge has been attempted.
    pub merge_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Terminal state of one staging task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Staged,
    StageFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub store: String,
    pub entity: Entity,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal state of one entity merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Merged,
    MergeFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub entity: Entity,
    pub status: MergeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What happened to the downstream dashboard refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Triggered,
    /// Attempted but the service rejected it. Never fails the run.
    Failed(String),
    Skipped,
    /// No dashboard is configured.
    Disabled,
}

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub invocation_id: String,
    pub staging: Vec<StageResult>,
    /// Empty when phase 2 was skipped.
    pub merges: Vec<MergeResult>,
    pub refresh: RefreshOutcome,
}

impl RunReport {
    pub fn all_staged(&self) -> bool {
        self.staging.iter().all(|s| s.status == StageStatus::Staged)
    }

    pub fn merge_status(&self, entity: Entity) -> Option<&MergeStatus> {
        self.merges
            .iter()
            .find(|m| m.entity == entity)
            .map(|m| &m.status)
    }

    /// True only when every task staged and every merge ran and succeeded.
    pub fn succeeded(&self) -> bool {
        self.all_staged()
            && !self.merges.is_empty()
            && self.merges.iter().all(|m| m.status == MergeStatus::Merged)
    }
}
