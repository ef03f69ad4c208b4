use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::engine::types::Entity;
use crate::extract::DEFAULT_MIN_REQUEST_INTERVAL;
use crate::extract::shopify::DEFAULT_API_VERSION;
use crate::merge::MergePlan;
use crate::refresh::DashboardConfig;
use crate::staging::records::store_prefix;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// One Shopify storefront.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub name: String,
    pub shop_name: Option<String>,
    pub access_token: Option<String>,
    /// Prefix prepended to order, line-item and customer ids.
    pub id_prefix: Option<String>,
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn id_prefix(&self) -> String {
        self.id_prefix
            .clone()
            .unwrap_or_else(|| store_prefix(&self.name))
    }
}

/// Configuration loaded from `shopetl.yaml`.
/// Every field is optional; missing values come from the environment or defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub stores: Option<Vec<StoreConfig>>,
    pub entities: Option<Vec<Entity>>,
    pub max_workers: Option<usize>,
    pub min_request_interval_ms: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub api_version: Option<String>,
    /// Overrides `https://{shop}.myshopify.com`, mostly for tests.
    pub api_base_url: Option<String>,
    pub queries_dir: Option<String>,
    /// When set, raw batches are written here before loading.
    pub archive_dir: Option<String>,
    pub merge: MergePlan,
    pub dashboard: Option<DashboardConfig>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn fill(slot: &mut Option<String>, key: &str) {
    if slot.is_none() {
        *slot = env_var(key);
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `shopetl.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("shopetl.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: PipelineConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Fill secrets and connection settings the file left out from the
    /// process environment.
    pub fn apply_env(&mut self) {
        if self.database_url.is_none() {
            self.database_url = env_var("DATABASE_URL").or_else(database_url_from_parts);
        }

        if self.max_workers.is_none() {
            self.max_workers = env_var("SHOPETL_MAX_WORKERS").and_then(|v| v.parse().ok());
        }

        if self.stores.is_none() {
            self.stores = Some(vec![
                StoreConfig::named("retail"),
                StoreConfig::named("wholesale"),
            ]);
        }
        if let Some(stores) = self.stores.as_mut() {
            for store in stores.iter_mut() {
                let upper = store.name.to_uppercase();
                fill(&mut store.shop_name, &format!("{}_SHOP_NAME", upper));
                fill(&mut store.access_token, &format!("{}_ACCESS_TOKEN", upper));
            }
        }

        let mut dashboard = self.dashboard.take().unwrap_or_default();
        fill(&mut dashboard.dataset_id, "DATASET_ID");
        fill(&mut dashboard.tenant_id, "TENANT_ID");
        fill(&mut dashboard.client_id, "CLIENT_ID");
        fill(&mut dashboard.username, "BI_USERNAME");
        fill(&mut dashboard.password, "BI_PASSWORD");
        if dashboard.dataset_id.is_some() {
            self.dashboard = Some(dashboard);
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No warehouse configured: set database_url or DATABASE_URL")
        })
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn stores(&self) -> &[StoreConfig] {
        self.stores.as_deref().unwrap_or(&[])
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores().iter().map(|s| s.name.clone()).collect()
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.entities
            .clone()
            .unwrap_or_else(|| Entity::ALL.to_vec())
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS).max(1)
    }

    pub fn min_request_interval(&self) -> Duration {
        self.min_request_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MIN_REQUEST_INTERVAL)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn api_version(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    pub fn queries_dir(&self) -> PathBuf {
        PathBuf::from(self.queries_dir.as_deref().unwrap_or("queries"))
    }

    pub fn archive_dir(&self) -> Option<PathBuf> {
        self.archive_dir.as_deref().map(PathBuf::from)
    }
}

fn database_url_from_parts() -> Option<String> {
    let user = env_var("DB_USER")?;
    let name = env_var("DB_NAME")?;
    let password = env_var("DB_PASSWORD");
    let host = env_var("DB_HOST").unwrap_or_else(|| "localhost".to_string());
    let port = env_var("DB_PORT").unwrap_or_else(|| "5432".to_string());

    match compose_database_url(&host, &port, &name, &user, password.as_deref()) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(host = %host, port = %port, error = %e, "Ignoring DB_* warehouse settings");
            None
        }
    }
}

/// Postgres URL from its parts with the credentials percent-encoded.
pub fn compose_database_url(
    host: &str,
    port: &str,
    name: &str,
    user: &str,
    password: Option<&str>,
) -> Result<String> {
    let mut url = Url::parse(&format!("postgres://{}:{}/{}", host, port, name))
        .with_context(|| format!("Invalid warehouse host or port: {}:{}", host, port))?;
    url.set_username(user)
        .map_err(|_| anyhow::anyhow!("Invalid warehouse user: {}", user))?;
    url.set_password(password)
        .map_err(|_| anyhow::anyhow!("Invalid warehouse password"))?;
    Ok(url.to_string())
}
