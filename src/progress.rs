//! Sync progress reporting.
//!
//! Reports observable progress during `rs-onyx sync` so operators see which
//! phase is running and how many records have been processed, delivered and
//! failed. Progress is emitted on **stderr** so stdout remains parseable.
//!
//! The engine also logs a `"sync progress"` tracing event per committed
//! batch; the reporter is the terminal-facing twin of that line.

use std::collections::BTreeMap;
use std::io::Write;

use crate::checkpoint::{Counts, SyncPhase};
use crate::error::FailureKind;

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Enrichment records loaded before the entity phases.
    Preloaded { customers: usize, assets: usize },
    /// A batch was delivered and checkpointed. Counts are cumulative for the run.
    Batch {
        phase: SyncPhase,
        page: u32,
        counts: Counts,
    },
    /// A phase finished. Counts and failures cover that phase only.
    PhaseDone {
        phase: SyncPhase,
        counts: Counts,
        failures: BTreeMap<FailureKind, u64>,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync tickets  page 12  1,234 processed ...".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Preloaded { customers, assets } => format!(
                "sync preload  {} customers  {} assets cached\n",
                format_number(*customers as u64),
                format_number(*assets as u64)
            ),
            SyncProgressEvent::Batch {
                phase,
                page,
                counts,
            } => format!(
                "sync {}  page {}  {} processed  {} delivered  {} failed\n",
                phase,
                page,
                format_number(counts.processed),
                format_number(counts.delivered),
                format_number(counts.failed)
            ),
            SyncProgressEvent::PhaseDone {
                phase,
                counts,
                failures,
            } => format!(
                "sync {}  done  {} delivered  {} failed{}  {} skipped\n",
                phase,
                format_number(counts.delivered),
                format_number(counts.failed),
                failure_breakdown(failures),
                format_number(counts.skipped)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Preloaded { customers, assets } => serde_json::json!({
                "event": "preloaded",
                "customers": customers,
                "assets": assets
            }),
            SyncProgressEvent::Batch {
                phase,
                page,
                counts,
            } => serde_json::json!({
                "event": "progress",
                "phase": phase,
                "page": page,
                "processed": counts.processed,
                "delivered": counts.delivered,
                "failed": counts.failed,
                "skipped": counts.skipped
            }),
            SyncProgressEvent::PhaseDone {
                phase,
                counts,
                failures,
            } => serde_json::json!({
                "event": "phase_done",
                "phase": phase,
                "processed": counts.processed,
                "delivered": counts.delivered,
                "failed": counts.failed,
                "skipped": counts.skipped,
                "failures": failures
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// ` (malformed 2, rejected 1)`, or nothing when there were no failures.
pub fn failure_breakdown(failures: &BTreeMap<FailureKind, u64>) -> String {
    let parts: Vec<String> = failures
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(kind, n)| format!("{} {}", kind, n))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
