//! Record identifiers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Length of every generated identifier.
pub const ID_LEN: usize = 26;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new 26-character lowercase hex identifier.
pub fn new_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(ID_LEN);
    id
}

/// Whether `id` looks like something [`new_id`] produced.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_well_formed() {
        let ids: HashSet<String> = (0..1000).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| is_valid_id(id)));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("ABCDEFABCDEFABCDEFABCDEFAB"));
        assert!(!is_valid_id("zzzzzzzzzzzzzzzzzzzzzzzzzz"));
    }
}
