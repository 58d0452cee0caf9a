//! SHA-256 hashing with one-character type prefixes.
//!
//! - `b:<hex>` — body hash of canonical JSON, or raw content hash.
//! - `c:<hex>` — content id of an atom without its `cid` field.
//! - `h:<hex>` — chained head hash, seeded at [`GENESIS_HEAD`].

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canon::{self, CanonError};

/// Head hash before the first atom of every shard.
pub const GENESIS_HEAD: &str = "h:genesis";

/// Lowercase hex SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Body hash: `b:` + SHA-256 of the canonical JSON of `body`.
///
/// # Errors
///
/// Returns [`CanonError`] when the body is not canonicalizable.
pub fn body_hash(body: &Value) -> Result<String, CanonError> {
    let canonical = canon::canonicalize(body)?;
    Ok(format!("b:{}", sha256_hex(canonical.as_bytes())))
}

/// Content hash of a document body: `b:` + SHA-256 of its UTF-8 bytes.
///
/// Raw bytes, no canonicalization; distinct inputs that would canonicalize
/// identically still hash differently here.
#[must_use]
pub fn content_hash(text: &str) -> String {
    format!("b:{}", sha256_hex(text.as_bytes()))
}

/// Content id for an atom value: `c:` + SHA-256 of the canonical JSON of the
/// value with its `cid` field stripped.
///
/// # Errors
///
/// Returns [`CanonError`] when the value is not canonicalizable.
pub fn cid_for_value(value: &Value) -> Result<String, CanonError> {
    let without_cid = canon::strip_field(value, "cid");
    let canonical = canon::canonicalize(&without_cid)?;
    Ok(format!("c:{}", sha256_hex(canonical.as_bytes())))
}

/// Next head hash: `h:` + SHA-256 of `prev_head ∥ ":" ∥ cid`.
#[must_use]
pub fn head_hash(prev_head: &str, cid: &str) -> String {
    let input = format!("{prev_head}:{cid}");
    format!("h:{}", sha256_hex(input.as_bytes()))
}

/// True when `expected` is the head obtained by chaining `cid` onto
/// `prev_head`.
#[must_use]
pub fn verify_chain_link(prev_head: &str, cid: &str, expected: &str) -> bool {
    head_hash(prev_head, cid) == expected
}
