use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};

pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_API_URL: &str = "https://api.powerbi.com/v1.0/myorg";
const POWERBI_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";

/// Downstream dataset refresh, fired once after a fully successful run.
#[async_trait]
pub trait DashboardRefresh: Send + Sync {
    async fn trigger(&self) -> Result<()>;
}

/// Power BI dataset and the account allowed to refresh it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub dataset_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub authority_url: Option<String>,
    pub api_url: Option<String>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PipelineError::Config(format!("dashboard.{} is not set", name)))
}

fn build_form_body(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Refreshes a Power BI dataset using the OAuth2 password grant.
pub struct PowerBiRefresh {
    client: reqwest::Client,
    token_url: String,
    refresh_url: String,
    client_id: String,
    username: String,
    password: String,
}

impl PowerBiRefresh {
    pub fn new(config: &DashboardConfig) -> Result<Self> {
        let tenant_id = required(&config.tenant_id, "tenant_id")?;
        let dataset_id = required(&config.dataset_id, "dataset_id")?;
        let authority = config
            .authority_url
            .as_deref()
            .unwrap_or(DEFAULT_AUTHORITY_URL)
            .trim_end_matches('/');
        let api = config
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/');

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            token_url: format!("{}/{}/oauth2/v2.0/token", authority, tenant_id),
            refresh_url: format!("{}/datasets/{}/refreshes", api, dataset_id),
            client_id: required(&config.client_id, "client_id")?.to_string(),
            username: required(&config.username, "username")?.to_string(),
            password: required(&config.password, "password")?.to_string(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let body = build_form_body(&[
            ("grant_type", "password"),
            ("client_id", &self.client_id),
            ("username", &self.username),
            ("password", &self.password),
            ("scope", POWERBI_SCOPE),
        ]);

        let response = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Refresh(format!("token request failed: {}", e)))?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Refresh(format!("invalid token response: {}", e)))?;

        match data.get("access_token").and_then(|v| v.as_str()) {
            Some(token) => Ok(token.to_string()),
            None => Err(PipelineError::Refresh(
                data.get("error_description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("token response has no access_token")
                    .to_string(),
            )),
        }
    }
}

#[async_trait]
impl DashboardRefresh for PowerBiRefresh {
    async fn trigger(&self) -> Result<()> {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(&self.refresh_url)
            .bearer_auth(token)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| PipelineError::Refresh(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            info!(url = %self.refresh_url, "Dataset refresh accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PipelineError::Refresh(format!(
            "refresh returned status {}: {}",
            status.as_u16(),
            body
        )))
    }
}
