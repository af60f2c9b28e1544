//! Content fingerprinting for change detection.
//!
//! A SHA-256 digest of the raw file bytes is the cheap "did this
//! change" signal used by the normalizer, resolver, and reconciler.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hex digest of raw content.
#[must_use]
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Idempotency key for a (path, content) pair.
///
/// A create replayed after a crash carries the same key, letting the
/// remote store collapse it onto the already-created document.
#[must_use]
pub fn op_key(path: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check if content has changed relative to a stored hash.
///
/// Returns `true` when there is no stored hash (never validated) or
/// the hashes differ.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.is_none_or(|h| h != current_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let hash1 = content_hash(b"# Title\n\nbody");
        let hash2 = content_hash(b"# Title\n\nbody");
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        assert_ne!(content_hash(b"one"), content_hash(b"two"));
    }

    #[test]
    fn test_op_key_distinguishes_paths() {
        let hash = content_hash(b"same body");
        assert_ne!(op_key("a.md", &hash), op_key("b.md", &hash));
        assert_eq!(op_key("a.md", &hash), op_key("a.md", &hash));
    }

    #[test]
    fn test_has_changed() {
        assert!(has_changed("abc123", None));
        assert!(has_changed("abc123", Some("xyz789")));
        assert!(!has_changed("abc123", Some("abc123")));
    }
}
