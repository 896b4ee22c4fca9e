//! Canonical JSON and reference hashing.
//!
//! Two peers must agree byte-for-byte on the hash of an event, so hashing
//! operates on a canonical encoding: object keys sorted lexicographically,
//! no insignificant whitespace, and the ephemeral `signatures` / `unsigned`
//! fields removed. `serde_json`'s default map representation is an ordered
//! tree, so re-serializing a parsed value yields the sorted compact form.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::EventError;

/// Fields excluded from the reference hash.
///
/// `signatures` differs per server and `unsigned` is mutable local
/// bookkeeping; neither is part of the event's identity.
const UNHASHED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Serialize a JSON value into its canonical byte encoding.
///
/// Keys are emitted in sorted order with compact separators. The value is
/// not modified; use [`reference_hash`] for the field-stripping variant
/// applied to whole events.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    // Map is a BTreeMap, so serialization is already key-sorted.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute the SHA-256 reference hash of a raw event.
///
/// The event is parsed, stripped of its unhashed fields, canonically
/// encoded, and hashed. The result is stable across servers and restarts
/// for the same event.
pub fn reference_hash(raw: &[u8]) -> Result<[u8; 32], EventError> {
    let mut value: Value = serde_json::from_slice(raw)?;
    let object = value.as_object_mut().ok_or(EventError::NotAnObject)?;
    for field in UNHASHED_FIELDS {
        object.remove(field);
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value));
    Ok(hasher.finalize().into())
}
