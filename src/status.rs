//! `rs-onyx status`: human-readable checkpoint summary.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::checkpoint::{Checkpoint, RunMode};
use crate::progress::format_number;

/// Recent errors shown by default; the checkpoint keeps more.
pub const SHOWN_ERRORS: usize = 10;

pub fn render(checkpoint: Option<&Checkpoint>, location: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Checkpoint: {}", location);

    let Some(cp) = checkpoint else {
        let _ = writeln!(out, "No sync has run yet.");
        return out;
    };

    let state = if cp.is_complete() {
        "complete"
    } else {
        "in progress (will resume)"
    };
    let mode = match cp.mode {
        RunMode::Full => "full".to_string(),
        RunMode::Incremental { since } => format!("incremental since {}", timestamp(since)),
    };

    let _ = writeln!(out, "Run:        {} ({})", cp.run_id, state);
    let _ = writeln!(out, "Mode:       {}", mode);
    let _ = writeln!(out, "Phase:      {}", cp.phase);
    if !cp.is_complete() {
        let _ = writeln!(out, "Cursor:     {}", cp.cursor);
    }
    let _ = writeln!(out, "Started:    {}", timestamp(cp.started_at));
    let _ = writeln!(out, "Updated:    {}", timestamp(cp.updated_at));
    let _ = writeln!(out);
    let _ = writeln!(out, "Processed:  {}", format_number(cp.counts.processed));
    let _ = writeln!(out, "Delivered:  {}", format_number(cp.counts.delivered));
    let _ = writeln!(out, "Skipped:    {}", format_number(cp.counts.skipped));
    let _ = writeln!(out, "Failed:     {}", format_number(cp.counts.failed));
    for (kind, n) in &cp.failures {
        let _ = writeln!(out, "  {:<10} {}", kind, format_number(*n));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Last full sync:        {}", maybe(cp.last_full_sync));
    let _ = writeln!(
        out,
        "Last incremental sync: {}",
        maybe(cp.last_incremental_sync)
    );

    if !cp.recent_errors.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Recent errors ({} of {} kept):",
            cp.recent_errors.len().min(SHOWN_ERRORS),
            cp.recent_errors.len()
        );
        for e in cp.recent_errors.iter().rev().take(SHOWN_ERRORS) {
            let _ = writeln!(out, "  {}", e);
        }
    }
    out
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn maybe(t: Option<DateTime<Utc>>) -> String {
    t.map(timestamp).unwrap_or_else(|| "never".to_string())
}
