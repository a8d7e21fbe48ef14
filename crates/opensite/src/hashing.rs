//! Stable content fingerprints.
//!
//! Branch configurations and dynamically derived table handles both need
//! identifiers that are identical across reruns of the same inputs. A
//! truncated SHA-256 gives 16 hex characters, which keeps derived table
//! names inside PostgreSQL's 63-byte identifier limit.

use sha2::{Digest, Sha256};

/// 16-hex-character fingerprint of arbitrary content.
pub fn hash16(content: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(content.as_ref());
    hex::encode(digest)[..16].to_string()
}

/// Full 64-hex-character fingerprint.
pub fn hash_full(content: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(content.as_ref()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn hash16_is_stable() {
        assert_eq!(hash16("abc"), hash16("abc"));
        assert_ne!(hash16("abc"), hash16("abd"));
        assert_eq!(hash16("abc").len(), 16);
    }

    proptest! {
        #[test]
        fn hash16_is_hex_and_fixed_width(content in ".*") {
            let h = hash16(content.as_bytes());
            prop_assert_eq!(h.len(), 16);
            prop_assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        }

        #[test]
        fn hash16_prefixes_hash_full(content in ".*") {
            prop_assert!(hash_full(content.as_bytes()).starts_with(&hash16(content.as_bytes())));
        }
    }
}
