//! Batch reconciliation: the safety net under the event stream.
//!
//! Watchers drop events (overflowed queues, files changed while the
//! process was down), so the engine periodically walks the whole vault
//! and diffs it against the identity store. Every discrepancy becomes
//! an ordinary [`ChangeEvent`] and re-enters the pipeline; the scan
//! itself never talks to the remote and never mutates anything.

use crate::error::Result;
use crate::model::{hash, ChangeEvent, EventKind, SyncState};
use crate::storage::IdentityStore;
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Metadata key recording the completion time of the last pass.
pub const LAST_RECONCILE_KEY: &str = "last_reconcile_at";

/// What one scan found.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct ReconcileReport {
    /// Markdown files seen on disk.
    pub scanned: usize,
    /// Files with no identity record.
    pub untracked: usize,
    /// Files whose content drifted from their record.
    pub drifted: usize,
    /// Records whose file is gone.
    pub vanished: usize,
    /// Unsynced records re-queued for another push attempt.
    pub pending: usize,
}

impl ReconcileReport {
    /// Total corrective events produced.
    #[must_use]
    pub fn corrections(&self) -> usize {
        self.untracked + self.drifted + self.vanished + self.pending
    }
}

pub(crate) fn file_mtime_millis(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

/// Whether a directory entry should be descended into / considered.
/// Hidden entries (`.obsidian`, `.git`, ...) are out of scope.
fn in_scope(entry: &walkdir::DirEntry) -> bool {
    entry.depth() == 0
        || entry
            .file_name()
            .to_str()
            .is_none_or(|name| !name.starts_with('.'))
}

/// Walk the vault and diff it against the store.
///
/// Returns the corrective events plus a report of what was found. The
/// caller feeds the events back through the normal resolve/dispatch
/// path, typically with bounded concurrency.
///
/// # Errors
///
/// Returns an error if the record listing fails. Unreadable files are
/// skipped with a warning rather than aborting the pass.
pub fn scan(vault_root: &Path, store: &IdentityStore) -> Result<(Vec<ChangeEvent>, ReconcileReport)> {
    let mut records: HashMap<String, _> = store
        .list_records()?
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();

    let mut events = Vec::new();
    let mut report = ReconcileReport::default();
    let now = chrono::Utc::now().timestamp_millis();

    for entry in WalkDir::new(vault_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(in_scope)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() || !super::normalizer::is_markdown(entry.path()) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(vault_root) else {
            continue;
        };
        let rel_str = rel.to_string_lossy().to_string();
        report.scanned += 1;

        let content = match std::fs::read(entry.path()) {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %rel_str, error = %err, "Skipping unreadable file");
                continue;
            }
        };
        let content_hash = hash::content_hash(&content);
        let observed_at = file_mtime_millis(entry.path());

        match records.remove(&rel_str) {
            None => {
                report.untracked += 1;
                events.push(ChangeEvent::new(rel, EventKind::Create, observed_at));
            }
            Some(record) => {
                if hash::has_changed(&content_hash, Some(&record.content_hash)) {
                    report.drifted += 1;
                    events.push(ChangeEvent::new(rel, EventKind::Modify, observed_at));
                } else if record.sync_state == SyncState::Unsynced {
                    // Content matches what we saw, but it never made it
                    // out. Push again.
                    report.pending += 1;
                    events.push(ChangeEvent::new(rel, EventKind::Modify, observed_at));
                }
            }
        }
    }

    // Whatever is left in the map has no file behind it. Dead records
    // stay parked until someone replays or purges their dead letter.
    for (path, record) in records {
        if record.sync_state == SyncState::Dead {
            continue;
        }
        report.vanished += 1;
        events.push(ChangeEvent::new(path, EventKind::Delete, now));
    }

    debug!(
        scanned = report.scanned,
        corrections = report.corrections(),
        "Reconcile scan complete"
    );
    Ok((events, report))
}
