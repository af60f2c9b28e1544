//! Remote document-store interface.
//!
//! The engine never talks to the network directly; everything goes
//! through [`DocumentApi`], and only the dispatcher is allowed to call
//! it. Errors are classified at this boundary into the taxonomy the
//! retry loop understands.

pub mod http;

pub use http::HttpDocumentApi;

use crate::model::{DocMeta, RemoteSnapshot};
use thiserror::Error;

/// Remote API failure, classified for the dispatcher.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failure, timeout, or 5xx. Retried with backoff.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// 429. Retried with backoff, but reported distinctly so
    /// dead-letter entries name the real cause.
    #[error("rate limited by remote")]
    RateLimited,

    /// The remote revision moved past our expected version. Not a
    /// failure: re-enters the resolver.
    #[error("version conflict: expected {expected}")]
    Conflict { expected: i64 },

    /// Validation, auth, or any other 4xx. Never retried.
    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

impl ApiError {
    /// Whether the dispatcher's backoff loop should retry this.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }

    /// Machine reason recorded on dead-letter entries.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "TRANSIENT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Conflict { .. } => "CONFLICT",
            Self::Permanent(_) => "PERMANENT",
        }
    }
}

/// A collection on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCollection {
    pub id: String,
    pub name: String,
}

/// Operations the sync engine requires of the remote store.
///
/// Implemented by [`HttpDocumentApi`] in production and by scripted
/// fakes in tests. Methods use `impl Future` so implementations stay
/// plain async fns without boxing.
pub trait DocumentApi: Send + Sync {
    /// Create a document, returning its id and initial version.
    ///
    /// `op_key` is an idempotency key: a replayed create with the same
    /// key must return the already-created document rather than make a
    /// second one.
    fn create_document(
        &self,
        collection: &str,
        title: &str,
        content: &str,
        meta: &DocMeta,
        op_key: &str,
    ) -> impl std::future::Future<Output = Result<RemoteSnapshot, ApiError>> + Send;

    /// Update a document, failing with [`ApiError::Conflict`] when
    /// `expected_version` is stale.
    fn update_document(
        &self,
        id: &str,
        title: &str,
        content: &str,
        meta: &DocMeta,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<RemoteSnapshot, ApiError>> + Send;

    /// Fetch the current state of a document, `None` if it is gone.
    fn get_document(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<RemoteSnapshot>, ApiError>> + Send;

    /// Delete a document. Deleting an already-deleted document is not
    /// an error.
    fn delete_document(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// List collections.
    fn list_collections(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteCollection>, ApiError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Transient("timeout".into()).is_transient());
        assert!(ApiError::RateLimited.is_transient());
        assert!(!ApiError::Conflict { expected: 3 }.is_transient());
        assert!(!ApiError::Permanent("401".into()).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(ApiError::Permanent("x".into()).code(), "PERMANENT");
    }
}
