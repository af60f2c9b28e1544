//! Operation dispatch: the only place remote calls happen.
//!
//! Each submitted operation runs through, in order: a per-category
//! circuit breaker, a per-category token bucket, the remote call, and
//! finally the local commit under the caller's lease. Transient
//! failures retry with capped exponential backoff and jitter; an
//! exhausted or permanently failed operation lands in the dead-letter
//! table while the record keeps its last committed state untouched.
//!
//! Backoff, bucket, and breaker math take explicit instants so the
//! tests never sleep through real delays.

use crate::config::{BreakerConfig, RateLimitConfig, RetryConfig};
use crate::engine::resolver::CommitPlan;
use crate::error::{Error, Result};
use crate::model::{DeadLetterEntry, OpKind, RemoteSnapshot, SyncOperation};
use crate::remote::{ApiError, DocumentApi, RemoteCollection};
use crate::storage::{IdentityStore, LeaseToken};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Endpoint category for throttling and breaker purposes. Writes to
/// different endpoints fail independently, so each gets its own bucket
/// and breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Create,
    Update,
    Delete,
    Read,
}

/// Meta key holding the most recent breaker trip as
/// `"<category> <unix_millis>"`. Surfaced by `vaultsync status`.
pub const LAST_BREAKER_OPEN_KEY: &str = "last_breaker_open";

impl Category {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Read => "read",
        }
    }
}

/// Nth-attempt backoff delay, exponential from the base and capped.
/// Attempt numbering starts at 1.
#[must_use]
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = retry.base_delay.saturating_mul(2u32.saturating_pow(exp));
    delay.min(retry.max_delay)
}

/// Randomize a delay into `[delay/2, 3·delay/2]` so synchronized
/// retries spread out in both directions.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..=1.5);
    delay.mul_f64(factor)
}

/// Lazily refilled token bucket.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            capacity: config.burst,
            tokens: config.burst,
            refill_per_sec: config.per_second,
            refilled_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.refilled_at = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_acquire(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed; exactly one probe is in flight.
    HalfOpen,
}

/// Rolling-window circuit breaker.
#[derive(Debug)]
struct CircuitBreaker {
    config: BreakerConfig,
    samples: VecDeque<bool>,
    state: BreakerState,
}

impl CircuitBreaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            state: BreakerState::Closed,
        }
    }

    /// Whether a call may proceed right now.
    fn allows(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen => false,
        }
    }

    /// Feed one sample; returns true when this sample tripped the
    /// circuit open.
    fn record(&mut self, success: bool, now: Instant) -> bool {
        if self.state == BreakerState::HalfOpen {
            if success {
                self.state = BreakerState::Closed;
                self.samples.clear();
                return false;
            }
            self.state = BreakerState::Open {
                until: now + self.config.cooldown,
            };
            return true;
        }

        self.samples.push_back(success);
        while self.samples.len() > self.config.window {
            self.samples.pop_front();
        }
        if self.state == BreakerState::Closed && self.samples.len() >= self.config.min_samples {
            let failures = self.samples.iter().filter(|ok| !**ok).count();
            #[allow(clippy::cast_precision_loss)]
            let rate = failures as f64 / self.samples.len() as f64;
            if rate >= self.config.failure_threshold {
                self.state = BreakerState::Open {
                    until: now + self.config.cooldown,
                };
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn is_open(&self, now: Instant) -> bool {
        matches!(self.state, BreakerState::Open { until } if now < until)
    }
}

/// Terminal outcome of a submitted operation.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Remote call (if any) succeeded and the local commit applied.
    Committed,
    /// No remote call was needed; local commit applied.
    Skipped,
    /// Optimistic concurrency lost: the remote moved past the expected
    /// version. The caller should re-fetch and re-resolve.
    RemoteConflict { expected: i64 },
    /// Exhausted or permanently failed; a dead-letter entry was stored.
    DeadLettered { id: String },
}

/// Serialized access point for the remote API.
pub struct Dispatcher<A> {
    api: A,
    store: Arc<IdentityStore>,
    vault_root: PathBuf,
    retry: RetryConfig,
    rate_limit: RateLimitConfig,
    breaker_config: BreakerConfig,
    buckets: Mutex<HashMap<Category, TokenBucket>>,
    breakers: Mutex<HashMap<Category, CircuitBreaker>>,
}

impl<A: DocumentApi> Dispatcher<A> {
    pub fn new(
        api: A,
        store: Arc<IdentityStore>,
        vault_root: PathBuf,
        retry: RetryConfig,
        rate_limit: RateLimitConfig,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            api,
            store,
            vault_root,
            retry,
            rate_limit,
            breaker_config: breaker,
            buckets: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run one operation to a terminal outcome.
    ///
    /// The caller holds the lease for `operation.path` (and, for moves,
    /// the source path) for the whole call; the commit happens under it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleReservation`] if the lease dies before the
    /// commit, and database errors from the commit itself. Remote
    /// failures never surface as errors; they become retries, conflicts,
    /// or dead letters.
    pub async fn submit(
        &self,
        mut operation: SyncOperation,
        commit: CommitPlan,
        lease: &LeaseToken,
        from_lease: Option<&LeaseToken>,
    ) -> Result<DispatchOutcome> {
        match operation.kind {
            OpKind::Skip => {
                self.apply_commit(commit, lease, from_lease, None)?;
                debug!(path = %operation.path, "No remote change needed");
                return Ok(DispatchOutcome::Skipped);
            }
            OpKind::CreateConflictCopy => {
                self.write_conflict_copy(&operation)?;
                self.apply_commit(commit, lease, from_lease, None)?;
                return Ok(DispatchOutcome::Committed);
            }
            OpKind::CreateRemote | OpKind::UpdateRemote | OpKind::DeleteRemote => {}
        }

        let category = match operation.kind {
            OpKind::CreateRemote => Category::Create,
            OpKind::UpdateRemote => Category::Update,
            _ => Category::Delete,
        };

        loop {
            operation.attempt += 1;

            if !self.breaker_allows(category) {
                if operation.attempt >= self.retry.max_attempts {
                    let err = Error::CircuitOpen {
                        category: category.as_str().to_string(),
                    };
                    let id = self.dead_letter(&operation, "CIRCUIT_OPEN", &err.to_string())?;
                    return Ok(DispatchOutcome::DeadLettered { id });
                }
                let delay = jittered(backoff_delay(operation.attempt, &self.retry));
                warn!(
                    path = %operation.path,
                    category = category.as_str(),
                    attempt = operation.attempt,
                    "Circuit open, deferring"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.throttle(category).await;

            match self.execute(&operation).await {
                Ok(snapshot) => {
                    self.breaker_record(category, true);
                    self.apply_commit(commit, lease, from_lease, snapshot.as_ref())?;
                    info!(
                        path = %operation.path,
                        kind = %operation.kind,
                        attempt = operation.attempt,
                        "Operation committed"
                    );
                    return Ok(DispatchOutcome::Committed);
                }
                Err(ApiError::Conflict { expected }) => {
                    // The server answered; this is contention, not an
                    // infrastructure failure.
                    self.breaker_record(category, true);
                    return Ok(DispatchOutcome::RemoteConflict { expected });
                }
                Err(err @ ApiError::Permanent(_)) => {
                    self.breaker_record(category, true);
                    warn!(path = %operation.path, error = %err, "Permanent remote failure");
                    let id = self.dead_letter(&operation, err.code(), &err.to_string())?;
                    return Ok(DispatchOutcome::DeadLettered { id });
                }
                Err(err) => {
                    self.breaker_record(category, false);
                    if operation.attempt >= self.retry.max_attempts {
                        warn!(
                            path = %operation.path,
                            attempts = operation.attempt,
                            error = %err,
                            "Retries exhausted"
                        );
                        let id = self.dead_letter(&operation, err.code(), &err.to_string())?;
                        return Ok(DispatchOutcome::DeadLettered { id });
                    }
                    let delay = jittered(backoff_delay(operation.attempt, &self.retry));
                    debug!(
                        path = %operation.path,
                        attempt = operation.attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch the current remote state of a document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] when reads are tripped and
    /// [`Error::Remote`] once transient retries are exhausted.
    pub async fn fetch_snapshot(&self, remote_id: &str) -> Result<Option<RemoteSnapshot>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.read_gate().await?;
            match self.api.get_document(remote_id).await {
                Ok(value) => {
                    self.breaker_record(Category::Read, true);
                    return Ok(value);
                }
                Err(err) => self.read_failure(err, attempt).await?,
            }
        }
    }

    /// List the remote store's collections.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::fetch_snapshot`].
    pub async fn list_collections(&self) -> Result<Vec<RemoteCollection>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.read_gate().await?;
            match self.api.list_collections().await {
                Ok(value) => {
                    self.breaker_record(Category::Read, true);
                    return Ok(value);
                }
                Err(err) => self.read_failure(err, attempt).await?,
            }
        }
    }

    /// Breaker + throttle front half shared by the read paths.
    async fn read_gate(&self) -> Result<()> {
        if !self.breaker_allows(Category::Read) {
            return Err(Error::CircuitOpen {
                category: Category::Read.as_str().to_string(),
            });
        }
        self.throttle(Category::Read).await;
        Ok(())
    }

    /// Back half: backs off and returns `Ok` when the read should be
    /// retried, the terminal error otherwise.
    async fn read_failure(&self, err: ApiError, attempt: u32) -> Result<()> {
        if err.is_transient() && attempt < self.retry.max_attempts {
            self.breaker_record(Category::Read, false);
            tokio::time::sleep(jittered(backoff_delay(attempt, &self.retry))).await;
            Ok(())
        } else {
            self.breaker_record(Category::Read, !err.is_transient());
            Err(Error::Remote(err.to_string()))
        }
    }

    async fn execute(&self, operation: &SyncOperation) -> std::result::Result<Option<RemoteSnapshot>, ApiError> {
        match operation.kind {
            OpKind::CreateRemote => {
                let payload = operation
                    .payload
                    .as_ref()
                    .ok_or_else(|| ApiError::Permanent("create without payload".into()))?;
                let snapshot = self
                    .api
                    .create_document(
                        &operation.collection,
                        &payload.title,
                        &payload.content,
                        &payload.meta,
                        &operation.op_key,
                    )
                    .await?;
                Ok(Some(snapshot))
            }
            OpKind::UpdateRemote => {
                let payload = operation
                    .payload
                    .as_ref()
                    .ok_or_else(|| ApiError::Permanent("update without payload".into()))?;
                let remote = operation
                    .remote
                    .as_ref()
                    .ok_or_else(|| ApiError::Permanent("update without remote snapshot".into()))?;
                let snapshot = self
                    .api
                    .update_document(
                        &remote.id,
                        &payload.title,
                        &payload.content,
                        &payload.meta,
                        remote.version,
                    )
                    .await?;
                Ok(Some(snapshot))
            }
            OpKind::DeleteRemote => {
                let remote = operation
                    .remote
                    .as_ref()
                    .ok_or_else(|| ApiError::Permanent("delete without remote snapshot".into()))?;
                self.api.delete_document(&remote.id).await?;
                Ok(None)
            }
            OpKind::Skip | OpKind::CreateConflictCopy => Ok(None),
        }
    }

    /// Materialize the losing side of a manual conflict as a sibling
    /// file. The sibling then flows through the pipeline as an ordinary
    /// create.
    fn write_conflict_copy(&self, operation: &SyncOperation) -> Result<()> {
        let Some(conflict_path) = operation.conflict_path.as_deref() else {
            return Err(Error::Other("conflict copy without target path".into()));
        };
        let Some(payload) = operation.payload.as_ref() else {
            return Err(Error::Other("conflict copy without payload".into()));
        };
        let target = self.vault_root.join(conflict_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &payload.content)?;
        info!(path = %operation.path, copy = %conflict_path, "Conflict copy written");
        Ok(())
    }

    fn apply_commit(
        &self,
        commit: CommitPlan,
        lease: &LeaseToken,
        from_lease: Option<&LeaseToken>,
        snapshot: Option<&RemoteSnapshot>,
    ) -> Result<()> {
        match commit {
            CommitPlan::Upsert(mut record) => {
                if let Some(snapshot) = snapshot {
                    record.remote_id = Some(snapshot.id.clone());
                    record.remote_version = Some(snapshot.version);
                    record.remote_modified_at = Some(snapshot.modified_at);
                }
                self.store.commit(lease, &record)
            }
            CommitPlan::Remove => self.store.commit_removal(lease),
            CommitPlan::Move { from: _, mut record } => {
                if let Some(snapshot) = snapshot {
                    record.remote_id = Some(snapshot.id.clone());
                    record.remote_version = Some(snapshot.version);
                    record.remote_modified_at = Some(snapshot.modified_at);
                }
                let from_lease = from_lease.ok_or_else(|| {
                    Error::Other("move commit without a source lease".into())
                })?;
                self.store.commit_move(from_lease, lease, &record)
            }
        }
    }

    /// Store a dead-letter entry for a terminally failed operation.
    /// The record itself is never touched here: its last committed
    /// state stands, and the entry alone documents the failure.
    fn dead_letter(&self, operation: &SyncOperation, code: &str, message: &str) -> Result<String> {
        let entry = DeadLetterEntry {
            id: uuid::Uuid::new_v4().to_string(),
            op_kind: operation.kind,
            path: operation.path.clone(),
            collection: operation.collection.clone(),
            payload: operation
                .payload
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
            attempts: operation.attempt,
            error_code: code.to_string(),
            error: message.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            replayed_at: None,
        };
        let id = self.store.push_dead_letter(&entry)?;
        warn!(
            path = %operation.path,
            id = %id,
            code,
            "Operation dead-lettered"
        );
        Ok(id)
    }

    async fn throttle(&self, category: Category) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().expect("bucket map poisoned");
                let now = Instant::now();
                buckets
                    .entry(category)
                    .or_insert_with(|| TokenBucket::new(&self.rate_limit, now))
                    .try_acquire(now)
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    fn breaker_allows(&self, category: Category) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker map poisoned");
        breakers
            .entry(category)
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
            .allows(Instant::now())
    }

    fn breaker_record(&self, category: Category, success: bool) {
        let opened = {
            let mut breakers = self.breakers.lock().expect("breaker map poisoned");
            breakers
                .entry(category)
                .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()))
                .record(success, Instant::now())
        };
        if opened {
            warn!(
                category = category.as_str(),
                "Circuit opened after repeated failures"
            );
            let stamp = format!(
                "{} {}",
                category.as_str(),
                chrono::Utc::now().timestamp_millis()
            );
            if let Err(err) = self.store.meta_set(LAST_BREAKER_OPEN_KEY, &stamp) {
                warn!(error = %err, "Failed to record breaker trip");
            }
        }
    }

    /// Direct access to the wrapped API, for test assertions.
    #[cfg(test)]
    pub(crate) fn api(&self) -> &A {
        &self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocMeta, DocPayload, FileRecord, SyncState, hash};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially_and_caps() {
        let retry = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        };
        assert_eq!(backoff_delay(1, &retry), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, &retry), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, &retry), Duration::from_secs(4));
        assert_eq!(backoff_delay(7, &retry), Duration::from_secs(60));
        assert_eq!(backoff_delay(100, &retry), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_spreads_around_the_delay() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let spread = jittered(delay);
            assert!(spread >= Duration::from_secs(5), "below half: {spread:?}");
            assert!(spread <= Duration::from_secs(15), "above 3/2: {spread:?}");
        }
    }

    #[test]
    fn test_token_bucket_burst_then_throttle() {
        let config = RateLimitConfig {
            per_second: 10.0,
            burst: 2.0,
        };
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(&config, t0);

        assert!(bucket.try_acquire(t0).is_none());
        assert!(bucket.try_acquire(t0).is_none());
        let wait = bucket.try_acquire(t0).expect("bucket should be empty");
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(100));

        // After a full refill interval one token is back.
        assert!(bucket.try_acquire(t0 + Duration::from_millis(150)).is_none());
    }

    #[test]
    fn test_breaker_opens_after_failures() {
        let config = BreakerConfig {
            window: 10,
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        };
        let mut breaker = CircuitBreaker::new(config);
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(breaker.allows(t0));
            let opened = breaker.record(false, t0);
            assert_eq!(opened, i == 4, "trip reported exactly once");
        }
        assert!(!breaker.allows(t0));
        assert!(breaker.is_open(t0));
    }

    #[test]
    fn test_breaker_half_open_probe_closes_on_success() {
        let config = BreakerConfig {
            window: 10,
            min_samples: 2,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        };
        let mut breaker = CircuitBreaker::new(config);
        let t0 = Instant::now();
        breaker.record(false, t0);
        breaker.record(false, t0);
        assert!(!breaker.allows(t0));

        let after = t0 + Duration::from_secs(31);
        // One probe allowed, concurrent calls still blocked.
        assert!(breaker.allows(after));
        assert!(!breaker.allows(after));

        breaker.record(true, after);
        assert!(breaker.allows(after));
    }

    #[test]
    fn test_breaker_half_open_probe_reopens_on_failure() {
        let config = BreakerConfig {
            window: 10,
            min_samples: 2,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        };
        let mut breaker = CircuitBreaker::new(config);
        let t0 = Instant::now();
        breaker.record(false, t0);
        breaker.record(false, t0);

        let after = t0 + Duration::from_secs(31);
        assert!(breaker.allows(after));
        assert!(breaker.record(false, after));
        assert!(!breaker.allows(after + Duration::from_secs(1)));
    }

    // ── submit() against a scripted remote ────────────────────

    #[derive(Default)]
    struct FakeApi {
        create_results: Mutex<VecDeque<std::result::Result<RemoteSnapshot, ApiError>>>,
        update_results: Mutex<VecDeque<std::result::Result<RemoteSnapshot, ApiError>>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeApi {
        fn script_create(self, result: std::result::Result<RemoteSnapshot, ApiError>) -> Self {
            self.create_results.lock().unwrap().push_back(result);
            self
        }

        fn script_update(self, result: std::result::Result<RemoteSnapshot, ApiError>) -> Self {
            self.update_results.lock().unwrap().push_back(result);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl DocumentApi for FakeApi {
        async fn create_document(
            &self,
            _collection: &str,
            _title: &str,
            _content: &str,
            _meta: &DocMeta,
            _op_key: &str,
        ) -> std::result::Result<RemoteSnapshot, ApiError> {
            self.calls.lock().unwrap().push("create");
            self.create_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unscripted create"))
        }

        async fn update_document(
            &self,
            _id: &str,
            _title: &str,
            _content: &str,
            _meta: &DocMeta,
            _expected_version: i64,
        ) -> std::result::Result<RemoteSnapshot, ApiError> {
            self.calls.lock().unwrap().push("update");
            self.update_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unscripted update"))
        }

        async fn get_document(
            &self,
            _id: &str,
        ) -> std::result::Result<Option<RemoteSnapshot>, ApiError> {
            self.calls.lock().unwrap().push("get");
            Ok(None)
        }

        async fn delete_document(&self, _id: &str) -> std::result::Result<(), ApiError> {
            self.calls.lock().unwrap().push("delete");
            Ok(())
        }

        async fn list_collections(
            &self,
        ) -> std::result::Result<Vec<RemoteCollection>, ApiError> {
            self.calls.lock().unwrap().push("list");
            Ok(Vec::new())
        }
    }

    fn snapshot(version: i64) -> RemoteSnapshot {
        RemoteSnapshot {
            id: "doc_1".into(),
            version,
            modified_at: 2_000,
            content_hash: None,
        }
    }

    fn create_operation(path: &str) -> SyncOperation {
        SyncOperation {
            kind: OpKind::CreateRemote,
            path: path.to_string(),
            collection: "notes".into(),
            payload: Some(DocPayload {
                title: "T".into(),
                content: "body".into(),
                meta: DocMeta {
                    title: "T".into(),
                    ..DocMeta::default()
                },
            }),
            op_key: hash::op_key(path, "h1"),
            content_hash: "h1".into(),
            local_modified_at: 1_000,
            remote: None,
            conflict_path: None,
            attempt: 0,
        }
    }

    fn dispatcher(api: FakeApi) -> (Dispatcher<FakeApi>, Arc<IdentityStore>) {
        let store = Arc::new(IdentityStore::open_memory().unwrap());
        let dispatcher = Dispatcher::new(
            api,
            Arc::clone(&store),
            PathBuf::from("/nonexistent-vault"),
            fast_retry(),
            RateLimitConfig {
                per_second: 10_000.0,
                burst: 10_000.0,
            },
            BreakerConfig::default(),
        );
        (dispatcher, store)
    }

    fn planned_record(path: &str) -> FileRecord {
        let mut record = FileRecord::unsynced(path, "h1", "notes", 1_000);
        record.sync_state = SyncState::Synced;
        record
    }

    #[tokio::test]
    async fn test_create_success_commits_remote_identity() {
        let api = FakeApi::default().script_create(Ok(snapshot(1)));
        let (dispatcher, store) = dispatcher(api);

        let lease = store.reserve("notes/a.md").unwrap();
        let outcome = dispatcher
            .submit(
                create_operation("notes/a.md"),
                CommitPlan::Upsert(planned_record("notes/a.md")),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(outcome, DispatchOutcome::Committed));
        let record = store.lookup("notes/a.md").unwrap().unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("doc_1"));
        assert_eq!(record.remote_version, Some(1));
        assert_eq!(record.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let api = FakeApi::default()
            .script_create(Err(ApiError::Transient("timeout".into())))
            .script_create(Err(ApiError::RateLimited))
            .script_create(Ok(snapshot(1)));
        let (dispatcher, store) = dispatcher(api);

        let lease = store.reserve("a.md").unwrap();
        let outcome = dispatcher
            .submit(
                create_operation("a.md"),
                CommitPlan::Upsert(planned_record("a.md")),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(outcome, DispatchOutcome::Committed));
        assert_eq!(dispatcher.api.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_record_untouched() {
        let api = FakeApi::default()
            .script_update(Err(ApiError::Transient("1".into())))
            .script_update(Err(ApiError::Transient("2".into())))
            .script_update(Err(ApiError::Transient("3".into())));
        let (dispatcher, store) = dispatcher(api);

        // A previously synced record; the failing update carries a new
        // content hash the record must never adopt.
        let mut synced = FileRecord::unsynced("a.md", "h0", "notes", 500);
        synced.remote_id = Some("doc_1".into());
        synced.remote_version = Some(1);
        synced.sync_state = SyncState::Synced;
        let seed = store.reserve("a.md").unwrap();
        store.commit(&seed, &synced).unwrap();
        store.release(seed);

        let mut operation = create_operation("a.md");
        operation.kind = OpKind::UpdateRemote;
        operation.remote = Some(snapshot(1));

        let lease = store.reserve("a.md").unwrap();
        let outcome = dispatcher
            .submit(
                operation,
                CommitPlan::Upsert(planned_record("a.md")),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        let DispatchOutcome::DeadLettered { id } = outcome else {
            panic!("expected dead letter");
        };
        let entry = store.get_dead_letter(&id).unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.error_code, "TRANSIENT");
        assert!(entry.payload.is_some());

        // The failed operation left the record exactly as committed.
        let record = store.lookup("a.md").unwrap().unwrap();
        assert_eq!(record.content_hash, "h0");
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.remote_id.as_deref(), Some("doc_1"));
        assert_eq!(record.remote_version, Some(1));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_without_retry() {
        let api = FakeApi::default().script_create(Err(ApiError::Permanent("422".into())));
        let (dispatcher, store) = dispatcher(api);

        let lease = store.reserve("a.md").unwrap();
        let outcome = dispatcher
            .submit(
                create_operation("a.md"),
                CommitPlan::Upsert(planned_record("a.md")),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(outcome, DispatchOutcome::DeadLettered { .. }));
        assert_eq!(dispatcher.api.call_count(), 1);
        // A failed create commits nothing; the path stays untracked.
        assert!(store.lookup("a.md").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_conflict_surfaces_for_re_resolution() {
        let api = FakeApi::default().script_update(Err(ApiError::Conflict { expected: 3 }));
        let (dispatcher, store) = dispatcher(api);

        let mut operation = create_operation("a.md");
        operation.kind = OpKind::UpdateRemote;
        operation.remote = Some(snapshot(3));

        let lease = store.reserve("a.md").unwrap();
        let outcome = dispatcher
            .submit(
                operation,
                CommitPlan::Upsert(planned_record("a.md")),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(
            outcome,
            DispatchOutcome::RemoteConflict { expected: 3 }
        ));
        // No commit happened; the path is still untracked.
        assert!(store.lookup("a.md").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_skip_commits_without_remote_call() {
        let api = FakeApi::default();
        let (dispatcher, store) = dispatcher(api);

        let mut operation = create_operation("a.md");
        operation.kind = OpKind::Skip;
        operation.payload = None;

        let lease = store.reserve("a.md").unwrap();
        let outcome = dispatcher
            .submit(
                operation,
                CommitPlan::Upsert(FileRecord::unsynced("a.md", "h1", "notes", 1_000)),
                &lease,
                None,
            )
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(outcome, DispatchOutcome::Skipped));
        assert_eq!(dispatcher.api.call_count(), 0);
        assert!(store.lookup("a.md").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_copy_writes_sibling_file() {
        let vault = tempfile::tempdir().unwrap();
        let store = Arc::new(IdentityStore::open_memory().unwrap());
        let dispatcher = Dispatcher::new(
            FakeApi::default(),
            Arc::clone(&store),
            vault.path().to_path_buf(),
            fast_retry(),
            RateLimitConfig::default(),
            BreakerConfig::default(),
        );

        let mut operation = create_operation("notes/a.md");
        operation.kind = OpKind::CreateConflictCopy;
        operation.conflict_path = Some("notes/a.conflict-20260828T000000.md".into());

        let mut parked = planned_record("notes/a.md");
        parked.remote_id = Some("doc_1".into());
        parked.sync_state = SyncState::Conflicted;

        let lease = store.reserve("notes/a.md").unwrap();
        let outcome = dispatcher
            .submit(operation, CommitPlan::Upsert(parked), &lease, None)
            .await
            .unwrap();
        store.release(lease);

        assert!(matches!(outcome, DispatchOutcome::Committed));
        let copy = vault.path().join("notes/a.conflict-20260828T000000.md");
        assert_eq!(std::fs::read_to_string(copy).unwrap(), "body");
        assert_eq!(
            store.lookup("notes/a.md").unwrap().unwrap().sync_state,
            SyncState::Conflicted
        );
    }
}
