//! Content hashing for bundles, configs and snapshots.

use sha2::{Digest, Sha256};

/// Hash arbitrary bytes and return the digest in `sha256:<hex>` format.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hash a JSON value over its canonical serialization.
///
/// `serde_json::Value` objects are backed by a `BTreeMap`, so `to_string`
/// emits keys in sorted order and two structurally equal values always hash
/// identically regardless of how they were built.
pub fn canonical_json_hash(value: &serde_json::Value) -> String {
    content_hash(value.to_string().as_bytes())
}
