//! Cache key derivation.

use sha2::{Digest, Sha256};

/// Compute a stable cache key from an operation kind, the archive
/// snapshot it targets, and the operation's parameters.
///
/// Components are newline-joined before hashing so that parameter
/// boundaries can't collide.
pub fn cache_key(kind: &str, snapshot_id: &str, params: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(snapshot_id.as_bytes());
    for param in params {
        hasher.update(b"\n");
        hasher.update(param.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_stability() {
        let key1 = cache_key("resolve", "snap-1", &["exact", "example.com/"]);
        let key2 = cache_key("resolve", "snap-1", &["exact", "example.com/"]);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_differs_by_kind() {
        let resolve = cache_key("resolve", "snap-1", &["example.com/"]);
        let record = cache_key("record", "snap-1", &["example.com/"]);
        assert_ne!(resolve, record);
    }

    #[test]
    fn test_key_differs_by_snapshot() {
        let one = cache_key("resolve", "snap-1", &["example.com/"]);
        let two = cache_key("resolve", "snap-2", &["example.com/"]);
        assert_ne!(one, two);
    }

    #[test]
    fn test_param_boundaries_cannot_collide() {
        let joined = cache_key("resolve", "snap-1", &["ab", "c"]);
        let split = cache_key("resolve", "snap-1", &["a", "bc"]);
        assert_ne!(joined, split);
    }

    #[test]
    fn test_key_format() {
        let key = cache_key("record", "snap-1", &["c1", "1000", "500"]);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
