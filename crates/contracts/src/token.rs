use rand::RngCore;

use crate::canonical;

// The hash doubles as the bearer capability, so it must be unguessable:
// 32 bytes of OS entropy, surfaced as the sha256 hex the rest of the
// system already knows how to validate.
pub fn generate_grant_hash() -> String {
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    canonical::sha256_hex(&entropy)
}

pub fn is_grant_hash(s: &str) -> bool {
    canonical::is_sha256_hex(s)
}

// Log-safe prefix; full hashes never appear in logs or audit actor labels.
pub fn hash_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_hashes_are_well_formed() {
        let hash = generate_grant_hash();
        assert!(is_grant_hash(&hash));
    }

    #[test]
    fn generated_hashes_do_not_repeat() {
        let a = generate_grant_hash();
        let b = generate_grant_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_prefix_truncates_without_panicking() {
        assert_eq!(hash_prefix("abcdef0123456789"), "abcdef01");
        assert_eq!(hash_prefix("abc"), "abc");
        assert_eq!(hash_prefix(""), "");
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(!is_grant_hash("not-a-hash"));
        assert!(!is_grant_hash(&"g".repeat(64)));
    }
}
