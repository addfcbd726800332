//! Durable sync progress and the stores that persist it.
//!
//! A [`Checkpoint`] records where a run stands: the current [`SyncPhase`],
//! the [`PageCursor`] inside that phase, cumulative counts and a failure
//! breakdown. The orchestrator is its only writer and advances it only
//! after a batch has been delivered, so on restart everything before the
//! cursor is known to be at the destination.
//!
//! Progress is monotonic: [`Checkpoint::advance`] refuses to move the
//! `(phase, cursor)` position backwards. Only an explicit full resync
//! ([`CheckpointStore::clear`]) starts a new lineage.
//!
//! The on-disk form is pretty-printed JSON so operators can read it.
//!
//! # Stores
//!
//! | Store | Atomicity |
//! |-------|-----------|
//! | [`FileCheckpointStore`] | write `<path>.tmp`, fsync, rename over `<path>` |
//! | [`MemoryCheckpointStore`] | none needed; nothing outlives the process |
//! | [`SqliteCheckpointStore`](crate::sqlite_store::SqliteCheckpointStore) | single upsert in a transaction |

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{FailureKind, SyncError};
use crate::models::EntityType;

/// Per-item error strings kept for operator inspection.
pub const MAX_RECENT_ERRORS: usize = 100;

/// Phase a run is in. Ordered as the phases execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Customers,
    Assets,
    Tickets,
    Invoices,
    Complete,
}

impl SyncPhase {
    pub fn for_entity(entity: EntityType) -> Self {
        match entity {
            EntityType::Customer => SyncPhase::Customers,
            EntityType::Asset => SyncPhase::Assets,
            EntityType::Ticket => SyncPhase::Tickets,
            EntityType::Invoice => SyncPhase::Invoices,
        }
    }

    pub fn entity(&self) -> Option<EntityType> {
        match self {
            SyncPhase::Customers => Some(EntityType::Customer),
            SyncPhase::Assets => Some(EntityType::Asset),
            SyncPhase::Tickets => Some(EntityType::Ticket),
            SyncPhase::Invoices => Some(EntityType::Invoice),
            SyncPhase::Complete => None,
        }
    }

    /// First phase after `self` whose entity type is enabled, or `Complete`.
    pub fn next_enabled(&self, enabled: impl Fn(EntityType) -> bool) -> SyncPhase {
        EntityType::ALL
            .into_iter()
            .map(SyncPhase::for_entity)
            .filter(|p| p > self)
            .find(|p| p.entity().is_some_and(&enabled))
            .unwrap_or(SyncPhase::Complete)
    }

    /// First enabled phase of a fresh run.
    pub fn first_enabled(enabled: impl Fn(EntityType) -> bool) -> SyncPhase {
        EntityType::ALL
            .into_iter()
            .find(|e| enabled(*e))
            .map(SyncPhase::for_entity)
            .unwrap_or(SyncPhase::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Customers => "customers",
            SyncPhase::Assets => "assets",
            SyncPhase::Tickets => "tickets",
            SyncPhase::Invoices => "invoices",
            SyncPhase::Complete => "complete",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position inside a phase: the next item to process is item `offset` of
/// page `page` (1-based pages, 0-based offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageCursor {
    pub page: u32,
    pub offset: usize,
}

impl PageCursor {
    pub const START: PageCursor = PageCursor { page: 1, offset: 0 };

    pub fn new(page: u32, offset: usize) -> Self {
        Self { page, offset }
    }

    /// Cursor after item `index` of `page`; rolls to the next page when
    /// the item was the page's last.
    pub fn after(page: u32, index: usize, page_len: usize) -> Self {
        if index + 1 >= page_len {
            Self::new(page + 1, 0)
        } else {
            Self::new(page, index + 1)
        }
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} offset {}", self.page, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunMode {
    Full,
    /// Only records with `updated_at > since`.
    Incremental { since: DateTime<Utc> },
}

impl RunMode {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            RunMode::Full => None,
            RunMode::Incremental { since } => Some(*since),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Records taken from the source, whatever their outcome.
    pub processed: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Records excluded by filters (not failures).
    #[serde(default)]
    pub skipped: u64,
}

impl Counts {
    pub fn since(&self, earlier: &Counts) -> Counts {
        Counts {
            processed: self.processed - earlier.processed,
            delivered: self.delivered - earlier.delivered,
            failed: self.failed - earlier.failed,
            skipped: self.skipped - earlier.skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub phase: SyncPhase,
    pub cursor: PageCursor,
    pub counts: Counts,
    #[serde(default)]
    pub failures: BTreeMap<FailureKind, u64>,
    #[serde(default)]
    pub recent_errors: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_full_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_incremental_sync: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// A fresh run starting at `phase`, carrying history from `previous`.
    pub fn begin(mode: RunMode, phase: SyncPhase, previous: Option<&Checkpoint>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            phase,
            cursor: PageCursor::START,
            counts: Counts::default(),
            failures: BTreeMap::new(),
            recent_errors: VecDeque::new(),
            started_at: now,
            updated_at: now,
            last_full_sync: previous.and_then(|p| p.last_full_sync),
            last_incremental_sync: previous.and_then(|p| p.last_incremental_sync),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == SyncPhase::Complete
    }

    /// Move to `(phase, cursor)`. Moving backwards is refused.
    pub fn advance(&mut self, phase: SyncPhase, cursor: PageCursor) -> Result<(), SyncError> {
        if (phase, cursor) < (self.phase, self.cursor) {
            return Err(SyncError::Checkpoint(format!(
                "refusing to move checkpoint back from {} {} to {} {}",
                self.phase, self.cursor, phase, cursor
            )));
        }
        self.phase = phase;
        self.cursor = cursor;
        self.updated_at = Utc::now();
        if phase == SyncPhase::Complete {
            match self.mode {
                RunMode::Full => self.last_full_sync = Some(self.started_at),
                RunMode::Incremental { .. } => self.last_incremental_sync = Some(self.started_at),
            }
        }
        Ok(())
    }

    pub fn record_failure(&mut self, kind: FailureKind, message: String) {
        self.counts.failed += 1;
        *self.failures.entry(kind).or_insert(0) += 1;
        self.recent_errors.push_back(message);
        while self.recent_errors.len() > MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Checkpoint(format!("serialize checkpoint: {}", e)))
    }

    pub fn from_json(text: &str, origin: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Checkpoint(format!("corrupt checkpoint in {}: {}", origin, e)))
    }
}

// ============ Stores ============

/// Durable home of the checkpoint.
///
/// `save` must leave the store holding either the previous or the new
/// checkpoint in full, even if the process dies mid-call.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` means no run has been recorded yet.
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError>;

    /// Forget all progress (explicit full resync).
    async fn clear(&self) -> Result<(), SyncError>;

    /// Where the checkpoint lives, for log lines and `status`.
    fn describe(&self) -> String;
}

/// JSON file written via temp file + rename.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> SyncError {
    SyncError::Checkpoint(format!("{} {}: {}", what, path.display(), e))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Checkpoint::from_json(&text, &self.path.display().to_string()).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read", &self.path, e)),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        let json = checkpoint.to_json()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create", parent, e))?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_err("create", &tmp, e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| io_err("write", &tmp, e))?;
        file.sync_all().await.map_err(|e| io_err("sync", &tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_err("rename", &self.path, e))
    }

    async fn clear(&self) -> Result<(), SyncError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", &self.path, e)),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local store: dry runs start from the real checkpoint without
/// ever writing it back.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: std::sync::Mutex<Option<Checkpoint>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new(initial: Option<Checkpoint>) -> Self {
        Self {
            state: std::sync::Mutex::new(initial),
            saves: Default::default(),
        }
    }

    pub fn snapshot(&self) -> Option<Checkpoint> {
        self.lock().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Checkpoint>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, SyncError> {
        Ok(self.snapshot())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        *self.lock() = Some(checkpoint.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        *self.lock() = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "in memory (not persisted)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn all(_: EntityType) -> bool {
        true
    }

    #[test]
    fn phase_progression_skips_disabled() {
        let no_invoices = |e: EntityType| e != EntityType::Invoice;
        assert_eq!(SyncPhase::first_enabled(all), SyncPhase::Customers);
        assert_eq!(
            SyncPhase::Tickets.next_enabled(no_invoices),
            SyncPhase::Complete
        );
        let tickets_only = |e: EntityType| e == EntityType::Ticket;
        assert_eq!(SyncPhase::first_enabled(tickets_only), SyncPhase::Tickets);
        assert_eq!(
            SyncPhase::Customers.next_enabled(tickets_only),
            SyncPhase::Tickets
        );
    }

    #[test]
    fn cursor_rolls_over_at_page_end() {
        assert_eq!(PageCursor::after(3, 4, 25), PageCursor::new(3, 5));
        assert_eq!(PageCursor::after(3, 24, 25), PageCursor::new(4, 0));
    }

    #[test]
    fn advance_is_monotonic() {
        let mut cp = Checkpoint::begin(RunMode::Full, SyncPhase::Customers, None);
        cp.advance(SyncPhase::Customers, PageCursor::new(2, 0)).unwrap();
        cp.advance(SyncPhase::Tickets, PageCursor::START).unwrap();
        assert!(cp
            .advance(SyncPhase::Customers, PageCursor::new(9, 0))
            .is_err());
        assert!(cp.advance(SyncPhase::Tickets, PageCursor::START).is_ok());

        assert!(cp.last_full_sync.is_none());
        cp.advance(SyncPhase::Complete, PageCursor::START).unwrap();
        assert_eq!(cp.last_full_sync, Some(cp.started_at));
    }

    #[test]
    fn recent_errors_are_bounded() {
        let mut cp = Checkpoint::begin(RunMode::Full, SyncPhase::Tickets, None);
        for i in 0..150 {
            cp.record_failure(FailureKind::Malformed, format!("err {}", i));
        }
        assert_eq!(cp.recent_errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(cp.recent_errors.front().unwrap(), "err 50");
        assert_eq!(cp.counts.failed, 150);
        assert_eq!(cp.failures[&FailureKind::Malformed], 150);
    }

    #[tokio::test]
    async fn file_store_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested/state.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut cp = Checkpoint::begin(RunMode::Full, SyncPhase::Assets, None);
        cp.record_failure(FailureKind::Rejected, "rs_asset_4: HTTP 422".into());
        store.save(&cp).await.unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"phase\": \"assets\""));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
        assert_eq!(store.load().await.unwrap(), Some(cp));

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileCheckpointStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, SyncError::Checkpoint(_)));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileCheckpointStore::new(&path);
        let cp = Checkpoint::begin(RunMode::Full, SyncPhase::Customers, None);
        store.save(&cp).await.unwrap();

        // a crash between temp write and rename leaves a stray temp file
        std::fs::write(dir.path().join("state.json.tmp"), "{ half").unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cp));
    }
}
