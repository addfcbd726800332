//! RepairShopr REST client.
//!
//! [`SourceApi`] is the seam the fetcher and orchestrator talk to; one call
//! is one HTTP request and exactly one rate-limiter token. Retries live
//! above this layer in [`RetryPolicy`](crate::retry::RetryPolicy), so every
//! retried attempt pays for its own token.
//!
//! # Endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | [`SourceApi::fetch_page`] | `GET /{customers,customer_assets,tickets,invoices}.json?page=N[&since_updated_at=T]` |
//! | [`SourceApi::ticket_comments`] | `GET /tickets/{id}/comments` |
//! | [`SourceApi::check`] | `GET /me` |
//!
//! All requests carry the API key as the `api_key` query parameter against
//! `https://{subdomain}.repairshopr.com/api/v1`.
//!
//! # Status mapping
//!
//! | Status | Error |
//! |--------|-------|
//! | 401, 403 | `Unauthorized` (fatal) |
//! | 429 | `RateLimited` with `Retry-After` seconds when present |
//! | 5xx | `Server` |
//! | other 4xx | `Rejected` |
//! | transport failure | `Network` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::SyncError;
use crate::models::{Comment, EntityType};
use crate::rate_limit::RateBudget;

/// One page of a list endpoint, items still unparsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub items: Vec<serde_json::Value>,
    /// Last-page marker when the source reports one.
    pub total_pages: Option<u32>,
}

/// Who the configured credential belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceIdentity {
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[async_trait]
pub trait SourceApi: Send + Sync {
    /// One page (1-based) of `entity`, restricted to `updated_at > since` when given.
    async fn fetch_page(
        &self,
        entity: EntityType,
        page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<SourcePage, SyncError>;

    /// Full comment history of one ticket. Items that fail to parse are dropped.
    async fn ticket_comments(&self, ticket_id: u64) -> Result<Vec<Comment>, SyncError>;

    /// Validate the credential.
    async fn check(&self) -> Result<SourceIdentity, SyncError>;
}

pub struct RepairShoprClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    budget: Arc<RateBudget>,
}

impl RepairShoprClient {
    pub fn new(
        config: &SourceConfig,
        api_key: String,
        budget: Arc<RateBudget>,
    ) -> Result<Self, SyncError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.repairshopr.com/api/v1", config.subdomain));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("rs-onyx-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            budget,
        })
    }

    async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, SyncError> {
        self.budget.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(%url, ?params, "GET");
        let response = self
            .http
            .get(&url)
            .query(params)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = truncate(response.text().await.unwrap_or_default(), 200);
            return Err(SyncError::from_status(status.as_u16(), retry_after, body));
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Network(format!("unreadable response from {}: {}", path, e)))
    }
}

#[async_trait]
impl SourceApi for RepairShoprClient {
    async fn fetch_page(
        &self,
        entity: EntityType,
        page: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<SourcePage, SyncError> {
        let mut params = vec![("page", page.to_string())];
        if let Some(since) = since {
            params.push((
                "since_updated_at",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        let body = self.get_json(entity.list_path(), &params).await?;
        Ok(parse_list(entity, body))
    }

    async fn ticket_comments(&self, ticket_id: u64) -> Result<Vec<Comment>, SyncError> {
        let body = self
            .get_json(&format!("/tickets/{}/comments", ticket_id), &[])
            .await?;
        let items = match body.get("comments") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    async fn check(&self) -> Result<SourceIdentity, SyncError> {
        let body = self.get_json("/me", &[]).await?;
        serde_json::from_value(body)
            .map_err(|e| SyncError::Network(format!("unreadable /me response: {}", e)))
    }
}

/// Split a list response into items and the page count (top level or under `meta`).
pub fn parse_list(entity: EntityType, mut body: serde_json::Value) -> SourcePage {
    let total_pages = body
        .get("total_pages")
        .or_else(|| body.get("meta").and_then(|m| m.get("total_pages")))
        .and_then(serde_json::Value::as_u64)
        .map(|n| n.min(u64::from(u32::MAX)) as u32);
    let items = match body.get_mut(entity.response_key()).map(serde_json::Value::take) {
        Some(serde_json::Value::Array(items)) => items,
        _ => Vec::new(),
    };
    SourcePage { items, total_pages }
}

/// `Retry-After` in seconds. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Cut an error body to at most `max` bytes on a char boundary.
pub(crate) fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn total_pages_top_level_or_meta() {
        let p = parse_list(
            EntityType::Ticket,
            json!({"tickets": [{"id": 1}], "total_pages": 3}),
        );
        assert_eq!(p.items.len(), 1);
        assert_eq!(p.total_pages, Some(3));

        let p = parse_list(
            EntityType::Asset,
            json!({"assets": [], "meta": {"total_pages": 7, "page": 1}}),
        );
        assert_eq!(p.total_pages, Some(7));

        let p = parse_list(EntityType::Customer, json!({"unexpected": true}));
        assert!(p.items.is_empty());
        assert_eq!(p.total_pages, None);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut h = HeaderMap::new();
        assert_eq!(retry_after(&h), None);
        h.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&h), Some(Duration::from_secs(2)));
        h.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&h), None);
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo".to_string(), 2), "h");
        assert_eq!(truncate("abc".to_string(), 10), "abc");
    }
}
