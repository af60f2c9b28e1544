//! Core data types for the sync engine.
//!
//! The types here mirror the three stores the engine mediates between:
//! the local tree (events), the identity table (records), and the remote
//! document store (operations and their terminal outcomes).

pub mod frontmatter;
pub mod hash;

pub use frontmatter::DocMeta;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Observed locally, never successfully pushed.
    Unsynced,
    /// Local content matches the last committed remote version.
    Synced,
    /// Local and remote diverged; a conflict copy exists or manual
    /// resolution is pending.
    Conflicted,
    /// Parked after a permanent validation failure; a dead-letter entry
    /// holds the details.
    Dead,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsynced => write!(f, "unsynced"),
            Self::Synced => write!(f, "synced"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(Self::Unsynced),
            "synced" => Ok(Self::Synced),
            "conflicted" => Ok(Self::Conflicted),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("Unknown sync state: {s}")),
        }
    }
}

/// Durable mapping from one local file to its remote counterpart.
///
/// One row per tracked path. The identity store is the only component
/// that mutates `sync_state` / `remote_id` / `remote_version`; everyone
/// else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Canonical path relative to the vault root, unique key.
    pub path: String,
    /// SHA-256 of the content this record was last validated against.
    /// Never reflects pending, uncommitted content.
    pub content_hash: String,
    /// Remote document id; always set when synced or conflicted, never
    /// when unsynced. A dead record keeps whatever id it had.
    pub remote_id: Option<String>,
    /// Last observed remote revision, used for optimistic concurrency.
    pub remote_version: Option<i64>,
    /// Local mtime at last validation (unix millis).
    pub local_modified_at: i64,
    /// Remote modification timestamp at last validation (unix millis).
    pub remote_modified_at: Option<i64>,
    /// Resolved target collection, cached from the path mapping.
    pub collection: String,
    /// Current lifecycle state.
    pub sync_state: SyncState,
}

impl FileRecord {
    /// A fresh record for a never-synced path.
    #[must_use]
    pub fn unsynced(path: &str, content_hash: &str, collection: &str, modified_at: i64) -> Self {
        Self {
            path: path.to_string(),
            content_hash: content_hash.to_string(),
            remote_id: None,
            remote_version: None,
            local_modified_at: modified_at,
            remote_modified_at: None,
            collection: collection.to_string(),
            sync_state: SyncState::Unsynced,
        }
    }

    /// Check the `remote_id` ⟷ `sync_state` invariant.
    ///
    /// `Dead` is deliberately exempt: a parked record keeps whatever id
    /// it had, so a later replay updates the existing remote document
    /// instead of creating a duplicate.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        match self.sync_state {
            SyncState::Synced | SyncState::Conflicted => self.remote_id.is_some(),
            SyncState::Unsynced => self.remote_id.is_none(),
            SyncState::Dead => true,
        }
    }
}

/// Kind of a normalized filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    Move,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Move => write!(f, "move"),
        }
    }
}

/// One logical, debounced filesystem change.
///
/// Produced by the normalizer, consumed exactly once by the resolver,
/// then discarded. Never persisted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Path relative to the vault root.
    pub path: PathBuf,
    pub kind: EventKind,
    /// Unix millis when the underlying burst was first observed.
    pub observed_at: i64,
    /// Source path for `Move` events only.
    pub from_path: Option<PathBuf>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: EventKind, observed_at: i64) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at,
            from_path: None,
        }
    }
}

/// Kind of remote operation the resolver decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    CreateRemote,
    UpdateRemote,
    Skip,
    CreateConflictCopy,
    DeleteRemote,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateRemote => write!(f, "create_remote"),
            Self::UpdateRemote => write!(f, "update_remote"),
            Self::Skip => write!(f, "skip"),
            Self::CreateConflictCopy => write!(f, "create_conflict_copy"),
            Self::DeleteRemote => write!(f, "delete_remote"),
        }
    }
}

impl std::str::FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_remote" => Ok(Self::CreateRemote),
            "update_remote" => Ok(Self::UpdateRemote),
            "skip" => Ok(Self::Skip),
            "create_conflict_copy" => Ok(Self::CreateConflictCopy),
            "delete_remote" => Ok(Self::DeleteRemote),
            _ => Err(format!("Unknown operation kind: {s}")),
        }
    }
}

/// Document content and metadata carried by an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocPayload {
    pub title: String,
    pub content: String,
    pub meta: DocMeta,
}

/// Snapshot of the remote side of a record, fetched just before the
/// resolver runs. `content_hash` is present only when the remote store
/// reports one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub id: String,
    pub version: i64,
    pub modified_at: i64,
    pub content_hash: Option<String>,
}

/// The unit of work submitted to the dispatcher.
///
/// Owned exclusively by the dispatcher from submission to terminal
/// outcome (commit, dead-letter, or absorbed skip).
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub kind: OpKind,
    /// Target record key (path relative to the vault root).
    pub path: String,
    pub collection: String,
    /// Content + metadata; absent for delete and skip.
    pub payload: Option<DocPayload>,
    /// Idempotency key: digest of (path, content hash). A replayed
    /// create after a crash lands on the same remote document.
    pub op_key: String,
    /// The local content hash this operation validates.
    pub content_hash: String,
    pub local_modified_at: i64,
    /// Remote snapshot the decision was based on, if the record had
    /// a prior sync.
    pub remote: Option<RemoteSnapshot>,
    /// Sibling path for `CreateConflictCopy`.
    pub conflict_path: Option<String>,
    /// Attempt counter, owned by the dispatcher's retry loop.
    pub attempt: u32,
}

/// A dispatched operation that exhausted retries or failed permanently.
///
/// Retained for inspection and manual replay; never auto-retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub op_kind: OpKind,
    pub path: String,
    pub collection: String,
    /// JSON-serialized [`DocPayload`], when the operation carried one.
    pub payload: Option<String>,
    /// Attempts consumed before giving up.
    pub attempts: u32,
    /// Machine reason: RATE_LIMITED, VALIDATION, PERMANENT, TRANSIENT.
    pub error_code: String,
    /// Human-readable last error.
    pub error: String,
    pub created_at: i64,
    /// Unix millis of the manual replay; `None` while pending.
    pub replayed_at: Option<i64>,
}

/// Conflict resolution strategy when both sides changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MergePolicy {
    /// Push the local content over the current remote version.
    LocalWins,
    /// Keep the remote version; adopt its revision marker locally.
    #[default]
    RemoteWins,
    /// Mark the record conflicted and touch nothing remotely.
    Manual,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalWins => write!(f, "local-wins"),
            Self::RemoteWins => write!(f, "remote-wins"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-wins" => Ok(Self::LocalWins),
            "remote-wins" => Ok(Self::RemoteWins),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown merge policy: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_sync_state_roundtrip() {
        for state in [
            SyncState::Unsynced,
            SyncState::Synced,
            SyncState::Conflicted,
            SyncState::Dead,
        ] {
            assert_eq!(SyncState::from_str(&state.to_string()).unwrap(), state);
        }
    }

    #[test]
    fn test_record_invariant() {
        let mut record = FileRecord::unsynced("a.md", "abc", "guides", 1);
        assert!(record.invariant_holds());

        record.sync_state = SyncState::Synced;
        assert!(!record.invariant_holds());

        record.remote_id = Some("doc_1".into());
        assert!(record.invariant_holds());

        // A parked record may keep its remote identity.
        record.sync_state = SyncState::Dead;
        assert!(record.invariant_holds());
    }

    #[test]
    fn test_op_kind_roundtrip() {
        for kind in [
            OpKind::CreateRemote,
            OpKind::UpdateRemote,
            OpKind::Skip,
            OpKind::CreateConflictCopy,
            OpKind::DeleteRemote,
        ] {
            assert_eq!(OpKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_merge_policy_default() {
        assert_eq!(MergePolicy::default(), MergePolicy::RemoteWins);
    }
}
