use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cli::config::StoreConfig;
use crate::error::{PipelineError, Result};
use crate::extract::{ApiConnector, RemoteApi};

pub const DEFAULT_API_VERSION: &str = "2025-10";

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const ERROR_BODY_LIMIT: usize = 500;

/// Shopify Admin GraphQL endpoint for one shop.
pub struct ShopifyClient {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl ShopifyClient {
    pub fn new(endpoint: String, access_token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            access_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl RemoteApi for ShopifyClient {
    async fn execute(&self, query: &str, variables: &Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        let body_text = response.text().await?;

        if !status.is_success() {
            return Err(PipelineError::Transport(format!(
                "POST {} returned status {}: {}",
                self.endpoint,
                status.as_u16(),
                truncate(&body_text, ERROR_BODY_LIMIT)
            )));
        }

        serde_json::from_str(&body_text).map_err(|e| {
            PipelineError::Protocol(format!("invalid JSON from {}: {}", self.endpoint, e))
        })
    }
}

/// Builds [`ShopifyClient`]s from store configuration.
pub struct ShopifyConnector {
    pub api_version: String,
    /// Replaces `https://{shop}.myshopify.com`, mainly for tests and proxies.
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl Default for ShopifyConnector {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            base_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ShopifyConnector {
    pub fn endpoint_for(&self, shop_name: &str) -> String {
        let base = match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.myshopify.com", shop_name),
        };
        format!("{}/admin/api/{}/graphql.json", base, self.api_version)
    }
}

impl ApiConnector for ShopifyConnector {
    fn connect(&self, store: &StoreConfig) -> Result<Box<dyn RemoteApi>> {
        let shop_name = store.shop_name.as_deref().ok_or_else(|| {
            PipelineError::Config(format!("store '{}' has no shop_name", store.name))
        })?;
        let token = store.access_token.clone().ok_or_else(|| {
            PipelineError::Config(format!("store '{}' has no access_token", store.name))
        })?;

        let client = ShopifyClient::new(self.endpoint_for(shop_name), token, self.timeout)?;
        Ok(Box::new(client))
    }
}
