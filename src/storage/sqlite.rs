//! SQLite identity store.
//!
//! The store owns the durable path → remote-document map and is the
//! only component allowed to mutate it. All mutation goes through a
//! per-path reservation: `reserve` hands out a lease token, `commit`
//! validates the token and applies the transition atomically, and a
//! lease that expires (holder crashed or hung) simply becomes
//! available again.
//!
//! Leases are process-local. The record table survives restart; an
//! in-flight lease does not need to, since a restart is equivalent to
//! instant expiry of every lease.

use crate::error::{Error, Result};
use crate::model::{DeadLetterEntry, FileRecord, SyncState};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default reservation lease time-to-live.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Proof of an exclusive per-path reservation.
///
/// Not `Clone`: there is exactly one live token per reservation, and
/// consuming APIs take it by value so a released lease cannot be
/// reused.
#[derive(Debug)]
pub struct LeaseToken {
    path: String,
    token: String,
}

impl LeaseToken {
    /// The reserved path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Per-state record counts for status reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StateCounts {
    pub unsynced: usize,
    pub synced: usize,
    pub conflicted: usize,
    pub dead: usize,
}

impl StateCounts {
    /// Total tracked records.
    #[must_use]
    pub fn total(&self) -> usize {
        self.unsynced + self.synced + self.conflicted + self.dead
    }
}

/// SQLite-backed identity store with process-local path leases.
pub struct IdentityStore {
    conn: Mutex<Connection>,
    leases: Mutex<HashMap<String, Lease>>,
    lease_ttl: Duration,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

impl IdentityStore {
    /// Open a store at the given path, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or
    /// schema/migrations fail.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if schema/migrations fail.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        super::schema::apply_schema(&conn)?;
        super::migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            leases: Mutex::new(HashMap::new()),
            lease_ttl: DEFAULT_LEASE_TTL,
        })
    }

    /// Override the lease time-to-live.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    // ── Reservations ──────────────────────────────────────────

    /// Reserve a path for one in-flight sync operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathReserved`] if another unexpired lease holds
    /// the path. The caller that loses this race skips the path; it
    /// will be picked up by the next event or reconcile pass.
    pub fn reserve(&self, path: &str) -> Result<LeaseToken> {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let now = Instant::now();

        if let Some(lease) = leases.get(path) {
            if lease.expires_at > now {
                return Err(Error::PathReserved {
                    path: path.to_string(),
                });
            }
            debug!(path, "Expired lease reclaimed");
        }

        let token = uuid::Uuid::new_v4().to_string();
        leases.insert(
            path.to_string(),
            Lease {
                token: token.clone(),
                expires_at: now + self.lease_ttl,
            },
        );

        Ok(LeaseToken {
            path: path.to_string(),
            token,
        })
    }

    /// Release a reservation. Silently ignores superseded tokens.
    pub fn release(&self, token: LeaseToken) {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        if leases.get(&token.path).is_some_and(|l| l.token == token.token) {
            leases.remove(&token.path);
        }
    }

    /// Validate that a token still holds its path's live lease.
    fn validate(&self, token: &LeaseToken) -> Result<()> {
        let leases = self.leases.lock().expect("lease map poisoned");
        match leases.get(&token.path) {
            Some(lease) if lease.token == token.token && lease.expires_at > Instant::now() => {
                Ok(())
            }
            _ => Err(Error::StaleReservation {
                path: token.path.clone(),
            }),
        }
    }

    // ── Records ───────────────────────────────────────────────

    /// Look up the record for a path.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn lookup(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().expect("connection poisoned");
        conn.query_row(
            "SELECT path, content_hash, remote_id, remote_version, local_modified_at,
                    remote_modified_at, collection, sync_state
             FROM file_records WHERE path = ?1",
            params![path],
            row_to_record,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All tracked records, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list_records(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock().expect("connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT path, content_hash, remote_id, remote_version, local_modified_at,
                    remote_modified_at, collection, sync_state
             FROM file_records ORDER BY path",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record counts per sync state.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn state_counts(&self) -> Result<StateCounts> {
        let conn = self.conn.lock().expect("connection poisoned");
        let mut stmt =
            conn.prepare("SELECT sync_state, COUNT(*) FROM file_records GROUP BY sync_state")?;
        let mut counts = StateCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
        })?;
        for row in rows {
            let (state, n) = row?;
            match state.as_str() {
                "unsynced" => counts.unsynced = n,
                "synced" => counts.synced = n,
                "conflicted" => counts.conflicted = n,
                "dead" => counts.dead = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Atomically apply a validated record transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleReservation`] if the caller's lease has
    /// expired or been superseded; the transition is discarded and the
    /// winner's state stands.
    pub fn commit(&self, token: &LeaseToken, record: &FileRecord) -> Result<()> {
        self.validate(token)?;
        debug_assert!(record.invariant_holds(), "remote_id/sync_state invariant");

        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("connection poisoned");
        conn.execute(
            "INSERT INTO file_records
                (path, content_hash, remote_id, remote_version, local_modified_at,
                 remote_modified_at, collection, sync_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                remote_id = excluded.remote_id,
                remote_version = excluded.remote_version,
                local_modified_at = excluded.local_modified_at,
                remote_modified_at = excluded.remote_modified_at,
                collection = excluded.collection,
                sync_state = excluded.sync_state,
                updated_at = excluded.updated_at",
            params![
                record.path,
                record.content_hash,
                record.remote_id,
                record.remote_version,
                record.local_modified_at,
                record.remote_modified_at,
                record.collection,
                record.sync_state.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Park a record as dead without touching its validated state.
    ///
    /// Only `sync_state` changes; the content hash and remote markers
    /// keep their last committed values, so a later fix resumes as a
    /// plain update. A no-op when the path has no record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleReservation`] on an invalid lease.
    pub fn mark_dead(&self, token: &LeaseToken) -> Result<()> {
        self.validate(token)?;
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("connection poisoned");
        conn.execute(
            "UPDATE file_records SET sync_state = 'dead', updated_at = ?2 WHERE path = ?1",
            params![token.path, now],
        )?;
        Ok(())
    }

    /// Remove a record after a confirmed remote + local delete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleReservation`] on an invalid lease.
    pub fn commit_removal(&self, token: &LeaseToken) -> Result<()> {
        self.validate(token)?;
        let conn = self.conn.lock().expect("connection poisoned");
        conn.execute(
            "DELETE FROM file_records WHERE path = ?1",
            params![token.path],
        )?;
        Ok(())
    }

    /// Move a record to a new path in one transaction (rename).
    ///
    /// Requires live leases on both the old and the new path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleReservation`] if either lease is invalid.
    pub fn commit_move(
        &self,
        old: &LeaseToken,
        new: &LeaseToken,
        record: &FileRecord,
    ) -> Result<()> {
        self.validate(old)?;
        self.validate(new)?;
        debug_assert_eq!(record.path, new.path);

        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.lock().expect("connection poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_records WHERE path = ?1",
            params![old.path],
        )?;
        tx.execute(
            "INSERT INTO file_records
                (path, content_hash, remote_id, remote_version, local_modified_at,
                 remote_modified_at, collection, sync_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                remote_id = excluded.remote_id,
                remote_version = excluded.remote_version,
                local_modified_at = excluded.local_modified_at,
                remote_modified_at = excluded.remote_modified_at,
                collection = excluded.collection,
                sync_state = excluded.sync_state,
                updated_at = excluded.updated_at",
            params![
                record.path,
                record.content_hash,
                record.remote_id,
                record.remote_version,
                record.local_modified_at,
                record.remote_modified_at,
                record.collection,
                record.sync_state.to_string(),
                now,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Dead letters ──────────────────────────────────────────

    /// Record a failed operation, returning the effective entry id.
    ///
    /// A pending entry for the same path and operation kind is
    /// refreshed in place rather than duplicated, so repeated
    /// reconcile passes against a failing remote do not grow the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<String> {
        let conn = self.conn.lock().expect("connection poisoned");
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM dead_letters
                 WHERE path = ?1 AND op_kind = ?2 AND replayed_at IS NULL",
                params![entry.path, entry.op_kind.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE dead_letters
                 SET payload = ?2, attempts = ?3, error_code = ?4, error = ?5, created_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    entry.payload,
                    entry.attempts,
                    entry.error_code,
                    entry.error,
                    entry.created_at,
                ],
            )?;
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO dead_letters
                (id, op_kind, path, collection, payload, attempts, error_code, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.op_kind.to_string(),
                entry.path,
                entry.collection,
                entry.payload,
                entry.attempts,
                entry.error_code,
                entry.error,
                entry.created_at,
            ],
        )?;
        Ok(entry.id.clone())
    }

    /// List pending (not yet replayed) dead-letter entries, newest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn list_dead_letters(&self, limit: Option<usize>) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.conn.lock().expect("connection poisoned");
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = conn.prepare(
            "SELECT id, op_kind, path, collection, payload, attempts, error_code, error,
                    created_at, replayed_at
             FROM dead_letters WHERE replayed_at IS NULL
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], row_to_dead_letter)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Fetch a dead-letter entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadLetterNotFound`] when no entry matches.
    pub fn get_dead_letter(&self, id: &str) -> Result<DeadLetterEntry> {
        let conn = self.conn.lock().expect("connection poisoned");
        conn.query_row(
            "SELECT id, op_kind, path, collection, payload, attempts, error_code, error,
                    created_at, replayed_at
             FROM dead_letters WHERE id = ?1",
            params![id],
            row_to_dead_letter,
        )
        .optional()?
        .ok_or_else(|| Error::DeadLetterNotFound { id: id.to_string() })
    }

    /// Stamp an entry as replayed, taking it off the pending list. The
    /// row itself is kept for audit until a purge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadLetterNotFound`] when no pending entry has
    /// this id.
    pub fn mark_replayed(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("connection poisoned");
        let n = conn.execute(
            "UPDATE dead_letters SET replayed_at = ?2 WHERE id = ?1 AND replayed_at IS NULL",
            params![id, chrono::Utc::now().timestamp_millis()],
        )?;
        if n == 0 {
            return Err(Error::DeadLetterNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Delete all dead-letter entries, returning the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn purge_dead_letters(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("connection poisoned");
        let n = conn.execute("DELETE FROM dead_letters", [])?;
        Ok(n)
    }

    // ── Engine metadata ───────────────────────────────────────

    /// Read an engine metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("connection poisoned");
        conn.query_row(
            "SELECT value FROM engine_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Write an engine metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("connection poisoned");
        conn.execute(
            "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let state: String = row.get(7)?;
    Ok(FileRecord {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        remote_id: row.get(2)?,
        remote_version: row.get(3)?,
        local_modified_at: row.get(4)?,
        remote_modified_at: row.get(5)?,
        collection: row.get(6)?,
        sync_state: state.parse().unwrap_or(SyncState::Unsynced),
    })
}

fn row_to_dead_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetterEntry> {
    let kind: String = row.get(1)?;
    Ok(DeadLetterEntry {
        id: row.get(0)?,
        op_kind: kind.parse().unwrap_or(crate::model::OpKind::CreateRemote),
        path: row.get(2)?,
        collection: row.get(3)?,
        payload: row.get(4)?,
        attempts: row.get(5)?,
        error_code: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        replayed_at: row.get(9)?,
    })
}
