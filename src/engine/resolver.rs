//! Conflict resolution: the pure decision core of the engine.
//!
//! [`resolve`] takes everything already known about one path -- the
//! normalized event, the identity record, the parsed local document,
//! and a fresh remote snapshot -- and returns exactly what should
//! happen, both remotely (a [`SyncOperation`]) and locally (a
//! [`CommitPlan`]). It performs no IO and consults no clocks beyond
//! the caller-supplied timestamp, so every branch of the decision
//! table is unit-testable with plain values.

use crate::model::{
    hash, ChangeEvent, DocMeta, DocPayload, EventKind, FileRecord, MergePolicy, OpKind,
    RemoteSnapshot, SyncOperation, SyncState,
};
use crate::model::frontmatter::Document;
use std::path::Path;

/// Local file content as read and parsed just before resolution.
#[derive(Debug, Clone)]
pub struct LocalDoc {
    pub doc: Document,
    /// Full file text, front matter included. Written verbatim when a
    /// conflict copy is produced.
    pub raw: String,
    pub content_hash: String,
    /// File mtime in unix millis.
    pub modified_at: i64,
}

/// Local commit to apply once the operation's remote side succeeds.
#[derive(Debug, Clone)]
pub enum CommitPlan {
    /// Upsert the record at its path. For create/update operations the
    /// dispatcher patches in the remote id/version from the response
    /// before committing.
    Upsert(FileRecord),
    /// Remove the record row.
    Remove,
    /// Re-key the record from an old path.
    Move { from: String, record: FileRecord },
}

/// A resolved decision for one event.
#[derive(Debug)]
pub struct Resolution {
    pub operation: SyncOperation,
    pub commit: CommitPlan,
    /// Synthetic events the engine should process next, in order, used
    /// when one observed change decomposes into independent ones.
    pub followups: Vec<ChangeEvent>,
    /// Which side took precedence, set only for a divergence.
    pub winner: Option<DivergenceWinner>,
}

/// Which side's edit takes precedence when both changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceWinner {
    Local,
    Remote,
}

/// Deterministic precedence for a divergence: the later modification
/// wins; equal timestamps fall back to lexical order of the content
/// fingerprints so every run picks the same side.
#[must_use]
pub fn divergence_winner(local: &LocalDoc, remote: &RemoteSnapshot) -> DivergenceWinner {
    match local.modified_at.cmp(&remote.modified_at) {
        std::cmp::Ordering::Greater => DivergenceWinner::Local,
        std::cmp::Ordering::Less => DivergenceWinner::Remote,
        std::cmp::Ordering::Equal => {
            let remote_hash = remote.content_hash.as_deref().unwrap_or(&remote.id);
            if local.content_hash.as_str() >= remote_hash {
                DivergenceWinner::Local
            } else {
                DivergenceWinner::Remote
            }
        }
    }
}

/// Everything the decision depends on.
#[derive(Debug)]
pub struct ResolveInput<'a> {
    pub event: &'a ChangeEvent,
    /// Identity record keyed by `event.path` (for moves, the destination).
    pub record: Option<&'a FileRecord>,
    /// For move events, the record keyed by the source path.
    pub from_record: Option<&'a FileRecord>,
    /// Parsed local content; `None` when the file no longer exists.
    pub local: Option<&'a LocalDoc>,
    /// Fresh remote state; `None` when the record has no remote id or
    /// the remote document is gone.
    pub remote: Option<&'a RemoteSnapshot>,
    pub policy: MergePolicy,
    pub default_collection: &'a str,
    /// Wall clock in unix millis; only used to name conflict copies.
    pub now_ms: i64,
}

/// Map a vault-relative path to its target collection.
///
/// Front matter `collection:` wins; otherwise the first directory
/// component; files at the vault root fall back to the default.
#[must_use]
pub fn collection_for(path: &Path, meta: Option<&DocMeta>, default: &str) -> String {
    if let Some(name) = meta.and_then(|m| m.collection.as_deref()) {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let mut components = path.components();
    let first = components.next();
    if components.next().is_some() {
        if let Some(std::path::Component::Normal(dir)) = first {
            if let Some(dir) = dir.to_str() {
                return dir.to_string();
            }
        }
    }
    default.to_string()
}

/// Sibling path for the losing side of a manual conflict:
/// `notes/a.md` becomes `notes/a.conflict-20260828T141503.md`.
#[must_use]
pub fn conflict_copy_path(path: &str, now_ms: i64) -> String {
    let stamp = chrono::DateTime::from_timestamp_millis(now_ms)
        .unwrap_or_default()
        .format("%Y%m%dT%H%M%S");
    match path.rsplit_once(".md") {
        Some((stem, _)) => format!("{stem}.conflict-{stamp}.md"),
        None => format!("{path}.conflict-{stamp}.md"),
    }
}

/// Whether the remote side moved past what the record last validated.
fn remote_advanced(record: &FileRecord, remote: &RemoteSnapshot) -> bool {
    match record.remote_version {
        Some(v) => remote.version != v,
        None => record
            .remote_modified_at
            .is_none_or(|m| remote.modified_at > m),
    }
}

fn payload_for(local: &LocalDoc) -> DocPayload {
    DocPayload {
        title: local.doc.meta.title.clone(),
        content: local.doc.body.clone(),
        meta: local.doc.meta.clone(),
    }
}

fn operation(
    kind: OpKind,
    path: &str,
    collection: &str,
    payload: Option<DocPayload>,
    content_hash: &str,
    local_modified_at: i64,
    remote: Option<&RemoteSnapshot>,
) -> SyncOperation {
    SyncOperation {
        kind,
        path: path.to_string(),
        collection: collection.to_string(),
        payload,
        op_key: hash::op_key(path, content_hash),
        content_hash: content_hash.to_string(),
        local_modified_at,
        remote: remote.cloned(),
        conflict_path: None,
        attempt: 0,
    }
}

/// Decide what one normalized event means.
#[must_use]
pub fn resolve(input: &ResolveInput<'_>) -> Resolution {
    match input.event.kind {
        EventKind::Create | EventKind::Modify => resolve_upsert(input),
        EventKind::Delete => resolve_delete(input),
        EventKind::Move => resolve_move(input),
    }
}

fn resolve_upsert(input: &ResolveInput<'_>) -> Resolution {
    let path = input.event.path.to_string_lossy().to_string();

    // The file vanished between the event and the read. The delete
    // notification is either already queued or was coalesced away, so
    // resolve it here.
    let Some(local) = input.local else {
        return resolve_delete(input);
    };

    let collection = collection_for(
        &input.event.path,
        Some(&local.doc.meta),
        input.default_collection,
    );

    let Some(record) = input.record else {
        // Never tracked: push a fresh document.
        let mut record = FileRecord::unsynced(&path, &local.content_hash, &collection, local.modified_at);
        record.sync_state = SyncState::Synced;
        return Resolution {
            operation: operation(
                OpKind::CreateRemote,
                &path,
                &collection,
                Some(payload_for(local)),
                &local.content_hash,
                local.modified_at,
                None,
            ),
            commit: CommitPlan::Upsert(record),
            followups: Vec::new(),
            winner: None,
        };
    };

    let local_changed = local.content_hash != record.content_hash;

    let Some(remote) = input.remote else {
        if record.remote_id.is_some() {
            // The remote document disappeared under us. This engine
            // pushes one way, so recreate it.
            let mut committed = record.clone();
            committed.content_hash = local.content_hash.clone();
            committed.local_modified_at = local.modified_at;
            committed.collection = collection.clone();
            committed.sync_state = SyncState::Synced;
            return Resolution {
                operation: operation(
                    OpKind::CreateRemote,
                    &path,
                    &collection,
                    Some(payload_for(local)),
                    &local.content_hash,
                    local.modified_at,
                    None,
                ),
                commit: CommitPlan::Upsert(committed),
                followups: Vec::new(),
                winner: None,
            };
        }
        // Tracked but never pushed (a prior attempt dead-lettered or
        // crashed). Same as a fresh create.
        let mut committed = record.clone();
        committed.content_hash = local.content_hash.clone();
        committed.local_modified_at = local.modified_at;
        committed.collection = collection.clone();
        committed.sync_state = SyncState::Synced;
        return Resolution {
            operation: operation(
                OpKind::CreateRemote,
                &path,
                &collection,
                Some(payload_for(local)),
                &local.content_hash,
                local.modified_at,
                None,
            ),
            commit: CommitPlan::Upsert(committed),
            followups: Vec::new(),
            winner: None,
        };
    };

    let remote_changed = remote_advanced(record, remote);

    match (local_changed, remote_changed) {
        (false, false) => Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &collection,
                None,
                &local.content_hash,
                local.modified_at,
                Some(remote),
            ),
            commit: CommitPlan::Upsert(record.clone()),
            followups: Vec::new(),
            winner: None,
        },
        (true, false) => {
            let mut committed = record.clone();
            committed.content_hash = local.content_hash.clone();
            committed.local_modified_at = local.modified_at;
            committed.collection = collection.clone();
            committed.sync_state = SyncState::Synced;
            Resolution {
                operation: operation(
                    OpKind::UpdateRemote,
                    &path,
                    &collection,
                    Some(payload_for(local)),
                    &local.content_hash,
                    local.modified_at,
                    Some(remote),
                ),
                commit: CommitPlan::Upsert(committed),
                followups: Vec::new(),
                winner: None,
            }
        }
        (false, true) => {
            // Only the remote moved: adopt its markers and stay quiet.
            let mut committed = record.clone();
            committed.remote_version = Some(remote.version);
            committed.remote_modified_at = Some(remote.modified_at);
            Resolution {
                operation: operation(
                    OpKind::Skip,
                    &path,
                    &collection,
                    None,
                    &local.content_hash,
                    local.modified_at,
                    Some(remote),
                ),
                commit: CommitPlan::Upsert(committed),
                followups: Vec::new(),
                winner: None,
            }
        }
        (true, true) => resolve_divergence(input, record, local, remote, &path, &collection),
    }
}

/// Both sides changed since the last validated state.
///
/// The local edit is always preserved first as a uniquely named
/// sibling file; only then does the merge policy decide what happens
/// to the original. No policy silently drops either version.
fn resolve_divergence(
    input: &ResolveInput<'_>,
    record: &FileRecord,
    local: &LocalDoc,
    remote: &RemoteSnapshot,
    path: &str,
    collection: &str,
) -> Resolution {
    let winner = divergence_winner(local, remote);
    let conflict_path = conflict_copy_path(path, input.now_ms);
    let mut op = operation(
        OpKind::CreateConflictCopy,
        path,
        collection,
        Some(DocPayload {
            title: local.doc.meta.title.clone(),
            content: local.raw.clone(),
            meta: local.doc.meta.clone(),
        }),
        &local.content_hash,
        local.modified_at,
        Some(remote),
    );
    op.conflict_path = Some(conflict_path.clone());

    // The sibling enters the pipeline as an ordinary create and gets
    // its own remote document.
    let mut followups = vec![ChangeEvent::new(
        conflict_path,
        EventKind::Create,
        input.now_ms,
    )];

    let mut committed = record.clone();
    committed.remote_version = Some(remote.version);
    committed.remote_modified_at = Some(remote.modified_at);

    match input.policy {
        MergePolicy::LocalWins => {
            // The record keeps its stale hash, so the re-queued modify
            // below resolves to a plain update at the adopted version
            // and pushes the local content over the remote edit.
            committed.sync_state = SyncState::Synced;
            followups.push(ChangeEvent::new(
                path.to_string(),
                EventKind::Modify,
                input.now_ms,
            ));
        }
        MergePolicy::RemoteWins => {
            // The remote edit stands on the original; the local edit
            // survives in the sibling. Adopting the local hash stops
            // the same divergence from re-firing.
            committed.content_hash = local.content_hash.clone();
            committed.local_modified_at = local.modified_at;
            committed.sync_state = SyncState::Synced;
        }
        MergePolicy::Manual => {
            // Parked until someone intervenes.
            committed.sync_state = SyncState::Conflicted;
        }
    }

    Resolution {
        operation: op,
        commit: CommitPlan::Upsert(committed),
        followups,
        winner: Some(winner),
    }
}

fn resolve_delete(input: &ResolveInput<'_>) -> Resolution {
    let path = input.event.path.to_string_lossy().to_string();

    let Some(record) = input.record else {
        // Untracked file removed; nothing to do anywhere.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                input.default_collection,
                None,
                "",
                input.event.observed_at,
                None,
            ),
            commit: CommitPlan::Remove,
            followups: Vec::new(),
            winner: None,
        };
    };

    if record.remote_id.is_none() {
        // Tracked but never pushed: just forget it.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &record.collection,
                None,
                &record.content_hash,
                input.event.observed_at,
                None,
            ),
            commit: CommitPlan::Remove,
            followups: Vec::new(),
            winner: None,
        };
    }

    let Some(remote) = input.remote else {
        // Remote document already gone; only the row remains.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &record.collection,
                None,
                &record.content_hash,
                input.event.observed_at,
                None,
            ),
            commit: CommitPlan::Remove,
            followups: Vec::new(),
            winner: None,
        };
    };

    if remote_advanced(record, remote) && input.policy != MergePolicy::LocalWins {
        // Deleted locally while edited remotely: the remote edit
        // survives; only the local tracking row goes away.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &record.collection,
                None,
                &record.content_hash,
                input.event.observed_at,
                input.remote,
            ),
            commit: CommitPlan::Remove,
            followups: Vec::new(),
            winner: None,
        };
    }

    Resolution {
        operation: operation(
            OpKind::DeleteRemote,
            &path,
            &record.collection,
            None,
            &record.content_hash,
            input.event.observed_at,
            input.remote,
        ),
        commit: CommitPlan::Remove,
        followups: Vec::new(),
        winner: None,
    }
}

fn resolve_move(input: &ResolveInput<'_>) -> Resolution {
    let path = input.event.path.to_string_lossy().to_string();
    let Some(from_path) = input.event.from_path.as_ref() else {
        // Malformed move; treat as an upsert of the destination.
        return resolve_upsert(input);
    };
    let from = from_path.to_string_lossy().to_string();

    let Some(from_record) = input.from_record else {
        // Source was never tracked: this is just a new file appearing.
        return resolve_upsert(input);
    };

    if input.record.is_some() {
        // Destination already tracked: the move clobbered another
        // document. Resolve the destination as a modify and deal with
        // the vacated source separately.
        let mut resolution = resolve_upsert(input);
        resolution.followups.push(ChangeEvent::new(
            from_path.clone(),
            EventKind::Delete,
            input.event.observed_at,
        ));
        return resolution;
    }

    let Some(local) = input.local else {
        // Destination already gone again; the stale source record is
        // cleaned up by the followup delete, which re-resolves with a
        // fresh remote snapshot.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &from_record.collection,
                None,
                &from_record.content_hash,
                input.event.observed_at,
                None,
            ),
            commit: CommitPlan::Remove,
            followups: vec![ChangeEvent::new(
                from_path.clone(),
                EventKind::Delete,
                input.event.observed_at,
            )],
            winner: None,
        };
    };

    let collection = collection_for(
        &input.event.path,
        Some(&local.doc.meta),
        input.default_collection,
    );

    let mut committed = from_record.clone();
    committed.path = path.clone();
    committed.content_hash = local.content_hash.clone();
    committed.local_modified_at = local.modified_at;
    committed.collection = collection.clone();

    if from_record.remote_id.is_none() {
        // Never pushed; the move is a create at the new path.
        committed.sync_state = SyncState::Synced;
        return Resolution {
            operation: operation(
                OpKind::CreateRemote,
                &path,
                &collection,
                Some(payload_for(local)),
                &local.content_hash,
                local.modified_at,
                None,
            ),
            commit: CommitPlan::Move {
                from,
                record: committed,
            },
            followups: Vec::new(),
            winner: None,
        };
    }

    if local.content_hash == from_record.content_hash {
        // Pure rename: the remote document is untouched, only the
        // identity row re-keys.
        return Resolution {
            operation: operation(
                OpKind::Skip,
                &path,
                &collection,
                None,
                &local.content_hash,
                local.modified_at,
                input.remote,
            ),
            commit: CommitPlan::Move {
                from,
                record: committed,
            },
            followups: Vec::new(),
            winner: None,
        };
    }

    // Moved and edited: push the new content to the same document.
    committed.sync_state = SyncState::Synced;
    Resolution {
        operation: operation(
            OpKind::UpdateRemote,
            &path,
            &collection,
            Some(payload_for(local)),
            &local.content_hash,
            local.modified_at,
            input.remote,
        ),
        commit: CommitPlan::Move {
            from,
            record: committed,
        },
        followups: Vec::new(),
        winner: None,
    }
}
