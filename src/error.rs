//! Error types for VaultSync CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, etc.)
//! - Retryability flags for scripted callers
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for VaultSync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string; shells on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    VaultNotFound,
    DeadLetterNotFound,

    // Validation (exit 4)
    MissingTitle,

    // Remote (exit 5)
    RemoteError,
    CircuitOpen,

    // Concurrency control (exit 6)
    StaleReservation,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::VaultNotFound => "VAULT_NOT_FOUND",
            Self::DeadLetterNotFound => "DEAD_LETTER_NOT_FOUND",
            Self::MissingTitle => "MISSING_TITLE",
            Self::RemoteError => "REMOTE_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::StaleReservation => "STALE_RESERVATION",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::VaultNotFound | Self::DeadLetterNotFound => 3,
            Self::MissingTitle => 4,
            Self::RemoteError | Self::CircuitOpen => 5,
            Self::StaleReservation => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether a caller may retry the same invocation later and expect
    /// a different outcome.
    ///
    /// True for remote transients, breaker trips, and lost reservation
    /// races. False for validation, not-found, and internal errors.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteError | Self::CircuitOpen | Self::StaleReservation | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in VaultSync CLI operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `vaultsync init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Vault root not found: {path}")]
    VaultNotFound { path: PathBuf },

    #[error("Dead-letter entry not found: {id}")]
    DeadLetterNotFound { id: String },

    #[error("Missing required front-matter title: {path}")]
    MissingTitle { path: String },

    #[error("Path already reserved by another operation: {path}")]
    PathReserved { path: String },

    #[error("Stale reservation for path: {path}")]
    StaleReservation { path: String },

    #[error("Circuit open for {category} operations")]
    CircuitOpen { category: String },

    #[error("Remote API error: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::VaultNotFound { .. } => ErrorCode::VaultNotFound,
            Self::DeadLetterNotFound { .. } => ErrorCode::DeadLetterNotFound,
            Self::MissingTitle { .. } => ErrorCode::MissingTitle,
            Self::PathReserved { .. } | Self::StaleReservation { .. } => {
                ErrorCode::StaleReservation
            }
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint for humans and scripts.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => {
                Some("Run `vaultsync init` to create the state database".to_string())
            }

            Self::AlreadyInitialized { path } => Some(format!(
                "State database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::VaultNotFound { path } => Some(format!(
                "No directory at '{}'. Pass the vault root with `--root <dir>`.",
                path.display()
            )),

            Self::DeadLetterNotFound { id } => Some(format!(
                "No dead-letter entry '{id}'. Use `vaultsync deadletter list` to see entries."
            )),

            Self::MissingTitle { path } => Some(format!(
                "Add a front-matter block with a `title:` field to {path}. \
                 Files without a title are never pushed."
            )),

            Self::PathReserved { .. } | Self::StaleReservation { .. } => Some(
                "Another sync operation for this path is in flight. \
                 It will be retried on the next event or reconcile pass."
                    .to_string(),
            ),

            Self::CircuitOpen { category } => Some(format!(
                "The remote has been failing {category} calls; dispatch is paused \
                 until the cooldown elapses. Check `vaultsync status`."
            )),

            Self::Config(_) => Some(
                "Set VAULTSYNC_API_URL and VAULTSYNC_API_TOKEN, or pass \
                 --api-url / --token."
                    .to_string(),
            ),

            Self::Remote(_) | Self::Database(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => {
                None
            }
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_category() {
        assert_eq!(Error::NotInitialized.exit_code(), 2);
        assert_eq!(
            Error::DeadLetterNotFound { id: "dl_1".into() }.exit_code(),
            3
        );
        assert_eq!(Error::MissingTitle { path: "a.md".into() }.exit_code(), 4);
        assert_eq!(Error::Remote("boom".into()).exit_code(), 5);
        assert_eq!(
            Error::StaleReservation { path: "a.md".into() }.exit_code(),
            6
        );
        assert_eq!(Error::Config("no url".into()).exit_code(), 7);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::RemoteError.is_retryable());
        assert!(ErrorCode::CircuitOpen.is_retryable());
        assert!(ErrorCode::StaleReservation.is_retryable());
        assert!(!ErrorCode::MissingTitle.is_retryable());
        assert!(!ErrorCode::DeadLetterNotFound.is_retryable());
    }

    #[test]
    fn test_structured_json_includes_hint() {
        let err = Error::NotInitialized;
        let json = err.to_structured_json();
        assert_eq!(json["error"]["code"], "NOT_INITIALIZED");
        assert!(json["error"]["hint"].as_str().unwrap().contains("init"));
    }

    #[test]
    fn test_code_strings_are_screaming_snake() {
        for code in [
            ErrorCode::MissingTitle,
            ErrorCode::StaleReservation,
            ErrorCode::CircuitOpen,
        ] {
            let s = code.as_str();
            assert!(s.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }
}
