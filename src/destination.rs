//! Delivery to the Onyx ingestion API.
//!
//! [`Destination::upsert`] is a single attempt for a single document; the
//! endpoint upserts by document id, so sending the same document twice is
//! harmless. [`deliver_batch`] layers the shared retry policy on top and
//! decides per document whether a failure is the document's fault
//! (counted, batch continues) or the destination's (batch aborted).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DestinationConfig;
use crate::document::SyncDocument;
use crate::error::SyncError;
use crate::retry::RetryPolicy;
use crate::source::{retry_after, truncate};

#[async_trait]
pub trait Destination: Send + Sync {
    async fn upsert(&self, doc: &SyncDocument) -> Result<(), SyncError>;

    fn describe(&self) -> String;
}

/// `POST {url}/onyx-api/ingestion` with a bearer token.
pub struct OnyxClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    source_tag: Option<String>,
}

impl OnyxClient {
    pub fn new(config: &DestinationConfig, url: &str, api_key: String) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("rs-onyx-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: format!("{}/onyx-api/ingestion", url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
            source_tag: config.source_tag.clone(),
        })
    }
}

#[async_trait]
impl Destination for OnyxClient {
    async fn upsert(&self, doc: &SyncDocument) -> Result<(), SyncError> {
        let body = doc.to_ingestion_body(self.source_tag.as_deref());
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(doc_id = %doc.id, status = status.as_u16(), "document accepted");
            return Ok(());
        }
        let retry_after = retry_after(response.headers());
        let body = truncate(response.text().await.unwrap_or_default(), 200);
        Err(SyncError::from_status(status.as_u16(), retry_after, body))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Accepts everything without network I/O (`sync --dry-run`).
#[derive(Default)]
pub struct DryRunDestination {
    seen: AtomicUsize,
}

impl DryRunDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Destination for DryRunDestination {
    async fn upsert(&self, doc: &SyncDocument) -> Result<(), SyncError> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        debug!(doc_id = %doc.id, chars = doc.content_len(), "dry run: not sent");
        Ok(())
    }

    fn describe(&self) -> String {
        "dry run (nothing sent)".to_string()
    }
}

/// Outcome of one batch. Failed documents carry the error that ended them.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
}

/// Run of consecutive documents that ran out of retries on transient errors.
///
/// Lives for a whole run, across batches. Any answer from the destination
/// (accepted or rejected) resets it.
#[derive(Debug)]
pub struct OutageWatch {
    threshold: usize,
    streak: usize,
}

impl OutageWatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            streak: 0,
        }
    }

    pub fn streak(&self) -> usize {
        self.streak
    }

    fn answered(&mut self) {
        self.streak = 0;
    }

    /// Count one exhausted document; `true` once the threshold is reached.
    fn exhausted(&mut self) -> bool {
        self.streak += 1;
        self.streak >= self.threshold
    }
}

/// Deliver `docs` in order, one retried upsert each.
///
/// - rejected (4xx) or retry-exhausted documents are reported and skipped;
/// - a fatal error (401/403) or cancellation aborts the batch;
/// - when `watch` sees its threshold of consecutive exhausted documents,
///   the destination is considered down and the batch fails with
///   `DestinationUnavailable`.
///
/// An aborted batch must not advance the checkpoint.
pub async fn deliver_batch(
    dest: &dyn Destination,
    docs: &[SyncDocument],
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    watch: &mut OutageWatch,
) -> Result<DeliveryReport, SyncError> {
    let mut report = DeliveryReport::default();

    for doc in docs {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let what = format!("deliver {}", doc.id);
        match retry.run(&what, cancel, |_| dest.upsert(doc)).await {
            Ok(()) => {
                watch.answered();
                report.accepted.push(doc.id.clone());
            }
            Err(e @ SyncError::Cancelled) => return Err(e),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let transient = matches!(e, SyncError::Exhausted { .. }) || e.is_retryable();
                if !transient {
                    watch.answered();
                } else if watch.exhausted() {
                    return Err(SyncError::DestinationUnavailable(format!(
                        "{} consecutive documents failed transiently, last {}: {}",
                        watch.streak(),
                        doc.id,
                        e
                    )));
                }
                warn!(doc_id = %doc.id, error = %e, "document not delivered");
                report.failed.push((doc.id.clone(), e));
            }
        }
    }
    Ok(report)
}
