//! Stable content fingerprinting.
//!
//! The engine's default cache keys are derived from `(task name, arguments)`
//! and must be stable across processes and across runs of the same process.
//! JSON objects serialize with lexicographically ordered keys (serde_json's
//! default map representation), so hashing the serialized form yields a
//! deterministic fingerprint for any JSON-compatible value.
//!
//! Note: the fingerprint intentionally does **not** include any fingerprint
//! of the task body itself; editing a task's code reuses cached results for
//! the remainder of the TTL.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Domain-separation prefix so fingerprints never collide with other sha256
/// uses of the same payload bytes.
const FINGERPRINT_SALT: &[u8] = b"weft:fingerprint:v1";

/// Computes a stable hex fingerprint of any serializable value.
///
/// Returns `None` when the value cannot be serialized to JSON (non-string
/// map keys and similar), in which case callers should fall back to a
/// non-cacheable path rather than guess at a key.
#[must_use]
pub fn fingerprint<T: Serialize>(value: &T) -> Option<String> {
    let bytes = serde_json::to_vec(value).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_SALT);
    hasher.update(&bytes);
    Some(hex_encode(&hasher.finalize()))
}

/// Lowercase hex encoding without pulling in an extra dependency.
fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}
