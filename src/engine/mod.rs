//! The sync engine: event intake to terminal outcome.
//!
//! Pipeline stages, each in its own module:
//!
//! - [`watch`] turns platform notifications into raw events
//! - [`normalizer`] debounces and coalesces them per path
//! - [`resolver`] decides, purely, what each change means
//! - [`dispatcher`] executes remote calls with retry, throttling, and
//!   dead-lettering, then commits under the path lease
//! - [`reconciler`] periodically re-derives missed work from a full
//!   tree scan
//!
//! [`SyncEngine`] wires them together and owns the run loop.

pub mod dispatcher;
pub mod normalizer;
pub mod reconciler;
pub mod resolver;
pub mod watch;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::model::{ChangeEvent, DeadLetterEntry, FileRecord, OpKind, hash};
use crate::remote::DocumentApi;
use crate::storage::{IdentityStore, LeaseToken};
use dispatcher::{DispatchOutcome, Dispatcher};
use normalizer::Normalizer;
use reconciler::ReconcileReport;
use resolver::{LocalDoc, ResolveInput};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How many optimistic-concurrency rounds one event may lose before it
/// is parked for the next reconcile pass.
const MAX_CONFLICT_ROUNDS: u32 = 3;

/// One vault's sync engine.
pub struct SyncEngine<A> {
    config: SyncConfig,
    store: Arc<IdentityStore>,
    dispatcher: Dispatcher<A>,
}

impl<A: DocumentApi + 'static> SyncEngine<A> {
    pub fn new(config: SyncConfig, store: Arc<IdentityStore>, api: A) -> Self {
        let dispatcher = Dispatcher::new(
            api,
            Arc::clone(&store),
            config.vault_root.clone(),
            config.retry.clone(),
            config.rate_limit.clone(),
            config.breaker.clone(),
        );
        Self {
            config,
            store,
            dispatcher,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<A> {
        &self.dispatcher
    }

    /// Drive one normalized event (and any events it decomposes into)
    /// to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns storage errors; remote failures are absorbed into
    /// retries and dead letters. A path already reserved by another
    /// in-flight task is skipped silently.
    pub async fn handle_event(&self, event: ChangeEvent) -> Result<()> {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            queue.extend(self.process_one(event).await?);
        }
        Ok(())
    }

    async fn process_one(&self, event: ChangeEvent) -> Result<Vec<ChangeEvent>> {
        let path = event.path.to_string_lossy().to_string();
        let lease = match self.store.reserve(&path) {
            Ok(lease) => lease,
            Err(Error::PathReserved { .. }) => {
                debug!(path = %path, "Path busy, skipping event");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let from_lease = match event.from_path.as_ref() {
            Some(from) => match self.store.reserve(&from.to_string_lossy()) {
                Ok(l) => Some(l),
                Err(Error::PathReserved { .. }) => {
                    debug!(path = %path, "Move source busy, skipping event");
                    self.store.release(lease);
                    return Ok(Vec::new());
                }
                Err(err) => {
                    self.store.release(lease);
                    return Err(err);
                }
            },
            None => None,
        };

        let result = self
            .resolve_and_dispatch(&event, &lease, from_lease.as_ref())
            .await;

        if let Some(from_lease) = from_lease {
            self.store.release(from_lease);
        }
        self.store.release(lease);
        result
    }

    async fn resolve_and_dispatch(
        &self,
        event: &ChangeEvent,
        lease: &LeaseToken,
        from_lease: Option<&LeaseToken>,
    ) -> Result<Vec<ChangeEvent>> {
        let path = event.path.to_string_lossy().to_string();
        let record = self.store.lookup(&path)?;
        let from_record = match event.from_path.as_ref() {
            Some(from) => self.store.lookup(&from.to_string_lossy())?,
            None => None,
        };

        let local = match self.read_local(&event.path)? {
            LocalRead::Parsed(doc) => Some(doc),
            LocalRead::Missing => None,
            LocalRead::Invalid => {
                self.reject_invalid(&path, record.as_ref(), lease)?;
                return Ok(Vec::new());
            }
        };

        // The snapshot that matters is the one for whichever record
        // already has a remote identity.
        let remote_id = record
            .as_ref()
            .and_then(|r| r.remote_id.clone())
            .or_else(|| from_record.as_ref().and_then(|r| r.remote_id.clone()));
        let mut remote = match remote_id.as_deref() {
            Some(id) => self.dispatcher.fetch_snapshot(id).await?,
            None => None,
        };

        let mut rounds = 0;
        loop {
            let resolution = resolver::resolve(&ResolveInput {
                event,
                record: record.as_ref(),
                from_record: from_record.as_ref(),
                local: local.as_ref(),
                remote: remote.as_ref(),
                policy: self.config.merge_policy,
                default_collection: &self.config.default_collection,
                now_ms: chrono::Utc::now().timestamp_millis(),
            });
            if resolution.operation.kind == OpKind::CreateConflictCopy {
                if let Some(winner) = resolution.winner {
                    warn!(
                        path = %path,
                        preferred = ?winner,
                        "Both sides changed; local edit preserved as conflict copy"
                    );
                }
            }
            let followups = resolution.followups;

            match self
                .dispatcher
                .submit(resolution.operation, resolution.commit, lease, from_lease)
                .await?
            {
                DispatchOutcome::RemoteConflict { expected } => {
                    rounds += 1;
                    if rounds >= MAX_CONFLICT_ROUNDS {
                        warn!(path = %path, rounds, "Remote keeps moving, leaving for reconcile");
                        return Ok(Vec::new());
                    }
                    debug!(path = %path, expected, "Version conflict, re-resolving");
                    remote = match remote_id.as_deref() {
                        Some(id) => self.dispatcher.fetch_snapshot(id).await?,
                        None => None,
                    };
                }
                _ => return Ok(followups),
            }
        }
    }

    fn read_local(&self, rel: &Path) -> Result<LocalRead> {
        let abs = self.config.vault_root.join(rel);
        let raw = match std::fs::read_to_string(&abs) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LocalRead::Missing);
            }
            Err(err) => return Err(err.into()),
        };
        let modified_at = reconciler::file_mtime_millis(&abs);
        let rel_str = rel.to_string_lossy();
        match crate::model::frontmatter::parse(&rel_str, &raw) {
            Ok(doc) => {
                let content_hash = hash::content_hash(raw.as_bytes());
                Ok(LocalRead::Parsed(LocalDoc {
                    doc,
                    raw,
                    content_hash,
                    modified_at,
                }))
            }
            Err(Error::MissingTitle { .. }) => Ok(LocalRead::Invalid),
            Err(err) => Err(err),
        }
    }

    /// A file that fails validation is a permanent failure: dead-letter
    /// it directly and never touch the remote. A tracked record is
    /// parked as dead with its last validated state intact; an
    /// untracked path gets no record at all.
    fn reject_invalid(
        &self,
        path: &str,
        record: Option<&FileRecord>,
        lease: &LeaseToken,
    ) -> Result<()> {
        let collection = record.map_or_else(
            || {
                resolver::collection_for(Path::new(path), None, &self.config.default_collection)
            },
            |r| r.collection.clone(),
        );
        let entry = DeadLetterEntry {
            id: uuid::Uuid::new_v4().to_string(),
            op_kind: if record.is_some_and(|r| r.remote_id.is_some()) {
                OpKind::UpdateRemote
            } else {
                OpKind::CreateRemote
            },
            path: path.to_string(),
            collection,
            payload: None,
            attempts: 0,
            error_code: "VALIDATION".to_string(),
            error: format!("{path}: front matter has no title"),
            created_at: chrono::Utc::now().timestamp_millis(),
            replayed_at: None,
        };
        let id = self.store.push_dead_letter(&entry)?;
        if record.is_some() {
            self.store.mark_dead(lease)?;
        }
        warn!(path, id = %id, "File rejected: missing title");
        Ok(())
    }

    /// One full corrective pass over the vault.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan itself fails; individual corrective
    /// events that fail are logged and left for the next pass.
    pub async fn reconcile_once(self: &Arc<Self>) -> Result<ReconcileReport> {
        let (events, report) = reconciler::scan(&self.config.vault_root, &self.store)?;
        info!(
            scanned = report.scanned,
            corrections = report.corrections(),
            "Reconcile pass starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.batch_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for event in events {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let path = event.path.clone();
                if let Err(err) = engine.handle_event(event).await {
                    warn!(path = %path.display(), error = %err, "Corrective event failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        self.store.meta_set(
            reconciler::LAST_RECONCILE_KEY,
            &chrono::Utc::now().timestamp_millis().to_string(),
        )?;
        Ok(report)
    }

    /// Watch the vault and sync until interrupted.
    ///
    /// Runs an initial reconcile pass to catch up on changes made while
    /// the engine was down, then alternates between draining watcher
    /// events and periodic reconciles. Ctrl-C drains in-flight
    /// operations before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher cannot start or the initial
    /// reconcile fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut watcher = watch::VaultWatcher::start(&self.config.vault_root)?;
        let mut normalizer = Normalizer::new(self.config.debounce, self.config.correlation);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut inflight: JoinSet<()> = JoinSet::new();

        self.reconcile_once().await?;

        let mut reconcile_timer = tokio::time::interval(self.config.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        reconcile_timer.reset(); // initial pass just ran

        info!(root = %self.config.vault_root.display(), "Sync engine running");
        loop {
            // Clean up finished tasks without blocking.
            while inflight.try_join_next().is_some() {}

            let deadline = normalizer.next_deadline();
            let debounce_timer = async {
                match deadline {
                    Some(at) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                raw = watcher.recv() => {
                    match raw {
                        Some(raw) => normalizer.observe(raw, Instant::now()),
                        None => {
                            warn!("Watcher stream ended");
                            break;
                        }
                    }
                }
                () = debounce_timer => {
                    for event in normalizer.tick(Instant::now()) {
                        let engine = Arc::clone(&self);
                        let semaphore = Arc::clone(&semaphore);
                        inflight.spawn(async move {
                            let _permit = semaphore.acquire_owned().await.ok();
                            let path = event.path.clone();
                            if let Err(err) = engine.handle_event(event).await {
                                warn!(path = %path.display(), error = %err, "Event failed");
                            }
                        });
                    }
                }
                _ = reconcile_timer.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        warn!(error = %err, "Periodic reconcile failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, draining in-flight operations");
                    break;
                }
            }
        }

        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}

enum LocalRead {
    Parsed(LocalDoc),
    Missing,
    Invalid,
}
