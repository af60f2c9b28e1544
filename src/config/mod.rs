//! Configuration management.
//!
//! VaultSync keeps a single global state database at
//! `~/.vaultsync/data/vaultsync.db`, regardless of which vault is being
//! synced. The vault root itself is always given per invocation.
//!
//! Engine tunables live in [`SyncConfig`]; everything has a default
//! and the interesting knobs are overridable from the CLI.

use crate::model::MergePolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the global VaultSync directory location (`~/.vaultsync`).
#[must_use]
pub fn global_state_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".vaultsync"))
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `VAULTSYNC_TEST_DB=1` (or any
/// non-empty value other than `0`/`false`). This redirects all database
/// operations to an isolated test database.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("VAULTSYNC_TEST_DB")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the test database path (`~/.vaultsync/test/vaultsync.db`).
#[must_use]
pub fn test_db_path() -> Option<PathBuf> {
    global_state_dir().map(|dir| dir.join("test").join("vaultsync.db"))
}

/// Resolve the state database path.
///
/// Priority:
/// 1. Explicit path from the `--db` flag
/// 2. `VAULTSYNC_TEST_DB` test mode → isolated test database
/// 3. `VAULTSYNC_DB` environment variable
/// 4. Global location: `~/.vaultsync/data/vaultsync.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if is_test_mode() {
        return test_db_path();
    }

    if let Ok(db_path) = std::env::var("VAULTSYNC_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_state_dir().map(|dir| dir.join("data").join("vaultsync.db"))
}

/// Retry policy for transient remote failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Cap on a single backoff delay.
    pub max_delay: Duration,
    /// Attempts before an operation is dead-lettered.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Proactive per-endpoint-category throttling.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second per category.
    pub per_second: f64,
    /// Burst capacity of each token bucket.
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 5.0,
            burst: 10.0,
        }
    }
}

/// Circuit breaker thresholds, per endpoint category.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window size (samples).
    pub window: usize,
    /// Minimum samples before the breaker may trip.
    pub min_samples: usize,
    /// Failure fraction at which the circuit opens.
    pub failure_threshold: f64,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Vault root directory being watched.
    pub vault_root: PathBuf,
    /// Collection for files directly under the vault root.
    pub default_collection: String,
    /// Debounce window for coalescing event bursts per path.
    pub debounce: Duration,
    /// Correlation window for pairing rename halves.
    pub correlation: Duration,
    /// Concurrent in-flight operations across distinct paths.
    pub concurrency: usize,
    /// Bounded concurrency for reconciler corrective passes.
    pub batch_concurrency: usize,
    /// Interval between periodic full-tree reconcile passes.
    pub reconcile_interval: Duration,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub merge_policy: MergePolicy,
}

impl SyncConfig {
    /// Config for a vault root with all defaults.
    #[must_use]
    pub fn for_vault(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
            default_collection: "general".to_string(),
            debounce: Duration::from_secs(2),
            correlation: Duration::from_millis(500),
            concurrency: 8,
            batch_concurrency: 5,
            reconcile_interval: Duration::from_secs(6 * 60 * 60),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            merge_policy: MergePolicy::default(),
        }
    }
}
