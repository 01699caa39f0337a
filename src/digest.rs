//! Content digests for package identity.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of the JCS (RFC 8785) serialization of `value`, hex encoded.
///
/// Equal values hash equally regardless of map key order.
pub fn canonical_sha256<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let jcs_bytes = serde_json_canonicalizer::to_vec(value)?;

    let mut hasher = Sha256::new();
    hasher.update(&jcs_bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of raw bytes, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = json!({"name": "ruby", "sha1": "abc"});
        let b = json!({"sha1": "abc", "name": "ruby"});
        assert_eq!(canonical_sha256(&a).unwrap(), canonical_sha256(&b).unwrap());
    }

    #[derive(Serialize)]
    struct Key<'a> {
        sha1: &'a str,
        name: &'a str,
    }

    #[test]
    fn test_struct_matches_equivalent_json() {
        let typed = canonical_sha256(&Key {
            sha1: "abc",
            name: "ruby",
        })
        .unwrap();
        let untyped = canonical_sha256(&json!({"name": "ruby", "sha1": "abc"})).unwrap();
        assert_eq!(typed, untyped);
        assert_eq!(typed.len(), 64);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
