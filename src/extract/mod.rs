pub mod archive;
pub mod shopify;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cli::config::StoreConfig;
use crate::error::{PipelineError, Result};

/// Minimum spacing between two requests from the same extractor.
pub const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(500);

/// Transport to the remote GraphQL API.
///
/// Implementations report non-2xx responses and network failures as
/// [`PipelineError::Transport`] and return the decoded response body
/// otherwise, error payloads included.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn execute(&self, query: &str, variables: &Value) -> Result<Value>;
}

/// Builds a fresh [`RemoteApi`] for one store. Every staging task asks for
/// its own client.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, store: &StoreConfig) -> Result<Box<dyn RemoteApi>>;
}

/// Search filter selecting records updated strictly after `ts`.
pub fn updated_after(ts: &DateTime<Utc>) -> String {
    format!(
        "updated_at:>'{}'",
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Walks a cursor-paginated connection until the API reports no next page.
pub struct PaginatedExtractor {
    api: Box<dyn RemoteApi>,
    label: String,
    min_interval: Duration,
    last_request: Option<Instant>,
}

impl PaginatedExtractor {
    pub fn new(api: Box<dyn RemoteApi>, label: impl Into<String>) -> Self {
        Self {
            api,
            label: label.into(),
            min_interval: DEFAULT_MIN_REQUEST_INTERVAL,
            last_request: None,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Fetch every edge of `resource_name`, optionally narrowed by a search
    /// filter. Any failing page aborts the whole call.
    pub async fn fetch_all(
        &mut self,
        query_template: &str,
        resource_name: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut variables = serde_json::Map::new();
            if let Some(filter) = filter {
                variables.insert("query".to_string(), Value::String(filter.to_string()));
            }
            variables.insert(
                "cursor".to_string(),
                cursor.clone().map(Value::String).unwrap_or(Value::Null),
            );

            let response = self
                .request(query_template, &Value::Object(variables))
                .await?;
            let page = parse_page(&response, resource_name)?;
            let fetched = page.edges.len();
            records.extend(page.edges);

            info!(
                source = %self.label,
                resource = %resource_name,
                fetched = fetched,
                total = records.len(),
                "Fetched page"
            );

            if !page.has_next_page {
                break;
            }
            cursor = Some(page.end_cursor.ok_or_else(|| {
                PipelineError::Protocol(format!(
                    "{}: hasNextPage without endCursor",
                    resource_name
                ))
            })?);
        }

        Ok(records)
    }

    async fn request(&mut self, query: &str, variables: &Value) -> Result<Value> {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(source = %self.label, wait_ms = wait.as_millis() as u64, "Rate limit pause");
                tokio::time::sleep(wait).await;
            }
        }

        let result = self.api.execute(query, variables).await;
        self.last_request = Some(Instant::now());
        result
    }
}

struct Page {
    edges: Vec<Value>,
    has_next_page: bool,
    end_cursor: Option<String>,
}

fn parse_page(response: &Value, resource_name: &str) -> Result<Page> {
    if let Some(errors) = response.get("errors")
        && !errors.is_null()
    {
        return Err(PipelineError::Protocol(format!("GraphQL error: {}", errors)));
    }

    let connection = response
        .get("data")
        .and_then(|d| d.get(resource_name))
        .ok_or_else(|| {
            PipelineError::Protocol(format!("response is missing data.{}", resource_name))
        })?;

    let edges = connection
        .get("edges")
        .and_then(|e| e.as_array())
        .cloned()
        .ok_or_else(|| {
            PipelineError::Protocol(format!("response is missing data.{}.edges", resource_name))
        })?;

    let page_info = connection.get("pageInfo");
    let has_next_page = page_info
        .and_then(|p| p.get("hasNextPage"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let end_cursor = page_info
        .and_then(|p| p.get("endCursor"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(Page {
        edges,
        has_next_page,
        end_cursor,
    })
}
