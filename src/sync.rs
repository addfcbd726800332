//! Sync orchestrator.
//!
//! A run walks the phases `customers → assets → tickets → invoices →
//! complete`, skipping disabled entity types. Before the first phase the
//! enrichment cache is preloaded with every customer and asset that later
//! phases need but will not stream themselves.
//!
//! Inside a phase, records are fetched page by page, enriched from the
//! cache, built into documents and accumulated into batches of
//! `sync.batch_size` records. A batch is committed as one step:
//!
//! 1. deliver its documents (per-document retry, per-document failure),
//! 2. fold counts and failures into a copy of the checkpoint,
//! 3. advance the copy's cursor past the batch and save it,
//! 4. only then adopt the copy as the run's checkpoint.
//!
//! If delivery aborts or the save fails, the saved checkpoint still points
//! at the start of the batch, so a restart re-delivers at most that batch.
//!
//! Cancellation is observed at suspension points (rate-limiter waits, HTTP
//! calls, backoff sleeps). A cancelled batch is never checkpointed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::DocumentBuilder;
use crate::cache::{CacheStats, EnrichmentCache, EnrichmentRecord};
use crate::checkpoint::{Checkpoint, CheckpointStore, Counts, PageCursor, RunMode, SyncPhase};
use crate::config::{Config, SyncConfig};
use crate::destination::{deliver_batch, DeliveryReport, Destination, OutageWatch};
use crate::document::SyncDocument;
use crate::error::{FailureKind, SyncError};
use crate::fetcher::{FetchedItem, PageStream};
use crate::models::{Comment, EntityType, RawEntity};
use crate::progress::{failure_breakdown, NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::rate_limit::{RateBudget, RateStats};
use crate::retry::RetryPolicy;
use crate::source::SourceApi;

/// How `run` picks its starting point.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Discard the checkpoint and load everything.
    pub full: bool,
    /// Start an incremental run from this instant regardless of history.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct SyncReport {
    pub checkpoint: Checkpoint,
    /// The run continued an interrupted checkpoint.
    pub resumed: bool,
    /// Counts for this invocation only.
    pub run: Counts,
    /// Failure breakdown for this invocation only.
    pub failures: BTreeMap<FailureKind, u64>,
    pub cache: CacheStats,
    pub rate: Option<RateStats>,
}

pub struct SyncEngine {
    source: Arc<dyn SourceApi>,
    destination: Arc<dyn Destination>,
    store: Arc<dyn CheckpointStore>,
    cache: EnrichmentCache,
    builder: DocumentBuilder,
    retry: RetryPolicy,
    sync: SyncConfig,
    page_size: usize,
    fetch_ticket_comments: bool,
    outage_after: usize,
    budget: Option<Arc<RateBudget>>,
    progress: Box<dyn SyncProgressReporter>,
    cancel: CancellationToken,
}

/// Records accumulated since the last commit.
#[derive(Default)]
struct PendingBatch {
    docs: Vec<SyncDocument>,
    records: usize,
    skipped: u64,
    failures: Vec<(FailureKind, String)>,
    page: u32,
    cursor: Option<PageCursor>,
}

impl PendingBatch {
    fn fail(&mut self, err: &SyncError, label: &str) {
        self.failures
            .push((err.failure_kind(), format!("{}: {}", label, err)));
    }
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        source: Arc<dyn SourceApi>,
        destination: Arc<dyn Destination>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            source,
            destination,
            store,
            cache: EnrichmentCache::new(config.cache.capacity(), config.cache.ttl()),
            builder: DocumentBuilder::new(
                &config.source.subdomain,
                config.sync.include_internal_comments,
            ),
            retry: RetryPolicy::from(&config.retry),
            sync: config.sync.clone(),
            page_size: config.source.page_size,
            fetch_ticket_comments: config.source.fetch_ticket_comments,
            outage_after: config.destination.outage_after,
            budget: None,
            progress: Box::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Limiter whose statistics end up in the report.
    pub fn with_rate_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn cache(&self) -> &EnrichmentCache {
        &self.cache
    }

    /// Run (or resume) a sync to completion.
    ///
    /// Per-record failures are counted in the checkpoint. Errors returned
    /// here ended the run; the last saved checkpoint is left as it was.
    pub async fn run(&self, options: RunOptions) -> Result<SyncReport, SyncError> {
        let previous = self.store.load().await?;
        let (mut cp, resumed) = self.plan(previous, options).await?;
        let at_start = cp.counts;
        let failures_at_start = cp.failures.clone();
        let mut watch = OutageWatch::new(self.outage_after);

        info!(
            run_id = %cp.run_id,
            mode = ?cp.mode,
            phase = %cp.phase,
            cursor = %cp.cursor,
            resumed,
            checkpoint = %self.store.describe(),
            destination = %self.destination.describe(),
            "sync starting"
        );

        if !resumed {
            if cp.is_complete() {
                warn!("no entity types enabled");
                cp.advance(SyncPhase::Complete, PageCursor::START)?;
            }
            self.save(&cp).await?;
        }

        if !cp.is_complete() {
            self.preload(&cp).await?;
        }

        while let Some(entity) = cp.phase.entity() {
            if self.sync.includes(entity) {
                self.run_phase(&mut cp, entity, &mut watch).await?;
            } else {
                let next = cp.phase.next_enabled(|e| self.sync.includes(e));
                debug!(phase = %cp.phase, next = %next, "phase disabled");
                let mut skipped = cp.clone();
                skipped.advance(next, PageCursor::START)?;
                self.save(&skipped).await?;
                cp = skipped;
            }
        }

        let run = cp.counts.since(&at_start);
        let failures = failures_since(&cp.failures, &failures_at_start);
        let cache = self.cache.stats();
        let rate = self.budget.as_ref().map(|b| b.stats());

        info!(
            run_id = %cp.run_id,
            processed = run.processed,
            delivered = run.delivered,
            failed = run.failed,
            skipped = run.skipped,
            total_failed = cp.counts.failed,
            failures = %failure_breakdown(&failures),
            "sync complete"
        );
        info!(
            entries = cache.len,
            hits = cache.hits,
            misses = cache.misses,
            evictions = cache.evictions,
            expired = cache.expired,
            hit_rate = %format!("{:.1}%", cache.hit_rate() * 100.0),
            "cache stats"
        );
        if let Some(rate) = rate {
            info!(
                requests = rate.requests_made,
                throttled = rate.requests_throttled,
                wait_ms = rate.total_wait.as_millis() as u64,
                "rate limiter stats"
            );
        }

        Ok(SyncReport {
            checkpoint: cp,
            resumed,
            run,
            failures,
            cache,
            rate,
        })
    }

    /// Resume, start incremental, or start full.
    async fn plan(
        &self,
        previous: Option<Checkpoint>,
        options: RunOptions,
    ) -> Result<(Checkpoint, bool), SyncError> {
        let first = SyncPhase::first_enabled(|e| self.sync.includes(e));

        if options.full {
            if previous.is_some() {
                self.store.clear().await?;
                info!("checkpoint cleared for full resync");
            }
            return Ok((Checkpoint::begin(RunMode::Full, first, previous.as_ref()), false));
        }

        if let Some(since) = options.since {
            if previous.as_ref().is_some_and(|p| !p.is_complete()) {
                warn!("abandoning interrupted run for an explicit incremental run");
            }
            let mode = RunMode::Incremental { since };
            return Ok((Checkpoint::begin(mode, first, previous.as_ref()), false));
        }

        Ok(match previous {
            Some(cp) if !cp.is_complete() => (cp, true),
            Some(done) => {
                let mode = RunMode::Incremental {
                    since: done.started_at,
                };
                (Checkpoint::begin(mode, first, Some(&done)), false)
            }
            None => (Checkpoint::begin(RunMode::Full, first, None), false),
        })
    }

    // ============ Preload ============

    async fn preload(&self, cp: &Checkpoint) -> Result<(), SyncError> {
        let (customers, assets) = preload_targets(cp, &self.sync);
        if !customers && !assets {
            debug!("preload not needed");
            return Ok(());
        }

        info!(customers, assets, "preloading enrichment cache");
        let mut loaded = (0, 0);
        if customers {
            loaded.0 = self.preload_entity(EntityType::Customer).await?;
        }
        if assets {
            loaded.1 = self.preload_entity(EntityType::Asset).await?;
        }
        info!(
            customers = loaded.0,
            assets = loaded.1,
            cached = self.cache.len(),
            "enrichment cache ready"
        );
        self.progress.report(SyncProgressEvent::Preloaded {
            customers: loaded.0,
            assets: loaded.1,
        });
        Ok(())
    }

    async fn preload_entity(&self, entity: EntityType) -> Result<usize, SyncError> {
        let mut stream = PageStream::new(
            self.source.as_ref(),
            entity,
            None,
            self.page_size,
            self.retry,
            self.cancel.clone(),
        );
        let mut loaded = 0;
        while let Some(page) = stream.next_page().await? {
            let records = page
                .items
                .into_iter()
                .filter_map(|item| item.entity.ok())
                .filter_map(|e| EnrichmentRecord::from_entity(&e));
            loaded += self.cache.preload(records);
        }
        Ok(loaded)
    }

    // ============ Phases ============

    async fn run_phase(
        &self,
        cp: &mut Checkpoint,
        entity: EntityType,
        watch: &mut OutageWatch,
    ) -> Result<(), SyncError> {
        let phase = cp.phase;
        let resume = cp.cursor;
        let counts_before = cp.counts;
        let failures_before = cp.failures.clone();
        info!(phase = %phase, cursor = %resume, since = ?cp.mode.since(), "phase starting");

        let mut stream = PageStream::new(
            self.source.as_ref(),
            entity,
            cp.mode.since(),
            self.page_size,
            self.retry,
            self.cancel.clone(),
        )
        .starting_at(resume.page);

        let mut batch = PendingBatch::default();
        while let Some(page) = stream.next_page().await? {
            let (page_no, page_len) = (page.page, page.len);
            for item in page.items {
                if page_no == resume.page && item.index < resume.offset {
                    continue;
                }
                batch.page = page_no;
                batch.cursor = Some(PageCursor::after(page_no, item.index, page_len));
                batch.records += 1;
                self.process(item, &mut batch).await?;

                if batch.records >= self.sync.batch_size {
                    let cursor = batch.cursor.unwrap_or(cp.cursor);
                    self.commit(cp, phase, cursor, std::mem::take(&mut batch), watch)
                        .await?;
                }
            }
            // Duplicates or stale records at the end of a page still move the cursor.
            batch.page = page_no;
            batch.cursor = Some(PageCursor::new(page_no + 1, 0));
        }

        let next = phase.next_enabled(|e| self.sync.includes(e));
        self.commit(cp, next, PageCursor::START, batch, watch).await?;

        let counts = cp.counts.since(&counts_before);
        let failures = failures_since(&cp.failures, &failures_before);
        info!(
            phase = %phase,
            processed = counts.processed,
            delivered = counts.delivered,
            failed = counts.failed,
            skipped = counts.skipped,
            failures = %failure_breakdown(&failures),
            "phase complete"
        );
        self.progress.report(SyncProgressEvent::PhaseDone {
            phase,
            counts,
            failures,
        });
        Ok(())
    }

    /// Filter, enrich and build one record into the pending batch.
    async fn process(&self, item: FetchedItem, batch: &mut PendingBatch) -> Result<(), SyncError> {
        let mut entity = match item.entity {
            Ok(entity) => entity,
            Err(e) => {
                let label = item.raw_id.unwrap_or_else(|| format!("item {}", item.index));
                warn!(id = %label, error = %e, "record not parsed");
                batch.fail(&e, &label);
                return Ok(());
            }
        };

        if let RawEntity::Ticket(ticket) = &mut entity {
            if !self.sync.ticket_status_allowed(&ticket.status) {
                debug!(ticket_id = ticket.id, status = %ticket.status, "ticket status filtered");
                batch.skipped += 1;
                return Ok(());
            }
            if self.fetch_ticket_comments && ticket.comments.is_empty() {
                ticket.comments = self.ticket_comments(ticket.id).await?;
            }
        }

        // Phases run in dependency order, so later records see these.
        if let Some(record) = EnrichmentRecord::from_entity(&entity) {
            self.cache.insert(record);
        }

        match self.builder.build(&entity, &self.cache) {
            Ok(doc) => batch.docs.push(doc),
            Err(e) => {
                let doc_id = entity.doc_id();
                warn!(doc_id = %doc_id, error = %e, "document not built");
                batch.fail(&e, &doc_id);
            }
        }
        Ok(())
    }

    /// Comments for one ticket; anything but cancellation or a fatal error
    /// degrades to an empty history.
    async fn ticket_comments(&self, ticket_id: u64) -> Result<Vec<Comment>, SyncError> {
        let source = self.source.as_ref();
        let what = format!("comments of ticket {}", ticket_id);
        match self
            .retry
            .run(&what, &self.cancel, |_| source.ticket_comments(ticket_id))
            .await
        {
            Ok(comments) => Ok(comments),
            Err(e) if matches!(e, SyncError::Cancelled) || e.is_fatal() => Err(e),
            Err(e) => {
                warn!(ticket_id, error = %e, "comments unavailable");
                Ok(Vec::new())
            }
        }
    }

    // ============ Commit ============

    /// Deliver the batch, then checkpoint `(phase, cursor)`.
    async fn commit(
        &self,
        cp: &mut Checkpoint,
        phase: SyncPhase,
        cursor: PageCursor,
        batch: PendingBatch,
        watch: &mut OutageWatch,
    ) -> Result<(), SyncError> {
        let report = if batch.docs.is_empty() {
            DeliveryReport::default()
        } else {
            deliver_batch(
                self.destination.as_ref(),
                &batch.docs,
                &self.retry,
                &self.cancel,
                watch,
            )
            .await?
        };

        let batch_phase = cp.phase;
        let mut next = cp.clone();
        next.counts.processed += batch.records as u64;
        next.counts.delivered += report.accepted.len() as u64;
        next.counts.skipped += batch.skipped;
        for (kind, message) in batch.failures {
            next.record_failure(kind, message);
        }
        for (doc_id, err) in report.failed {
            next.record_failure(err.failure_kind(), format!("{}: {}", doc_id, err));
        }
        next.advance(phase, cursor)?;
        self.save(&next).await?;
        *cp = next;

        if batch.records > 0 {
            info!(
                phase = %batch_phase,
                page = batch.page,
                processed = cp.counts.processed,
                delivered = cp.counts.delivered,
                failed = cp.counts.failed,
                "sync progress"
            );
            self.progress.report(SyncProgressEvent::Batch {
                phase: batch_phase,
                page: batch.page,
                counts: cp.counts,
            });
        }
        Ok(())
    }

    /// Save with the shared backoff. A save that never succeeds is fatal.
    ///
    /// Not cancellable: the batch it records has already been delivered.
    async fn save(&self, cp: &Checkpoint) -> Result<(), SyncError> {
        let mut attempt = 0u32;
        loop {
            match self.store.save(cp).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, None);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "checkpoint save failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt + 1, error = %e, "checkpoint unwritable");
                    return Err(match e {
                        SyncError::Checkpoint(_) => e,
                        other => SyncError::Checkpoint(other.to_string()),
                    });
                }
            }
        }
    }
}

/// Per-kind failures added since `before`, zero entries dropped.
fn failures_since(
    now: &BTreeMap<FailureKind, u64>,
    before: &BTreeMap<FailureKind, u64>,
) -> BTreeMap<FailureKind, u64> {
    now.iter()
        .map(|(k, n)| (*k, n.saturating_sub(before.get(k).copied().unwrap_or(0))))
        .filter(|(_, n)| *n > 0)
        .collect()
}

/// Which enrichment types to bulk-load before the phases run.
///
/// A type is loaded when a later enabled phase reads it, unless a full run
/// is about to stream that type from its first page anyway.
fn preload_targets(cp: &Checkpoint, sync: &SyncConfig) -> (bool, bool) {
    let pending = |p: SyncPhase| p >= cp.phase && p.entity().is_some_and(|e| sync.includes(e));
    let streamed_from_start = |p: SyncPhase| {
        cp.mode == RunMode::Full
            && pending(p)
            && (cp.phase < p || cp.cursor == PageCursor::START)
    };

    let customers_needed = [SyncPhase::Assets, SyncPhase::Tickets, SyncPhase::Invoices]
        .into_iter()
        .any(pending);
    let assets_needed = pending(SyncPhase::Tickets);

    (
        customers_needed && !streamed_from_start(SyncPhase::Customers),
        assets_needed && !streamed_from_start(SyncPhase::Assets),
    )
}
