//! Mapping key derivation — the composite identity that correlates
//! records across source aliases and keys the output upsert.
//!
//! Policy is strict: a key is built from ALL configured fields or not
//! at all. Partial keys would silently merge unrelated transactions,
//! which is worse than skipping a record and counting it.

use crate::types::{Document, FieldName, MappingKey};
use serde_json::Value;

/// Separator between field values in a composite key.
const KEY_SEPARATOR: &str = "_";

/// Build the mapping key for `record` from `key_fields` in declared
/// order. Returns `None` when any configured field is missing, null or
/// blank — the caller counts the record as skipped.
///
/// When `key_fields` is empty the record still gets a deterministic
/// identity derived from its storage id, namespaced by alias so records
/// from different collections never collide. An unset mapping
/// configuration must never drop an entire collection on the floor.
pub fn build_key(
    alias: &str,
    storage_id: i64,
    record: &Document,
    key_fields: &[FieldName],
) -> Option<MappingKey> {
    if key_fields.is_empty() {
        return Some(format!("{alias}:{storage_id}"));
    }

    let mut parts = Vec::with_capacity(key_fields.len());
    for field in key_fields {
        let value = record.get(field)?;
        let text = value_to_key_part(value)?;
        parts.push(text);
    }
    Some(parts.join(KEY_SEPARATOR))
}

/// String form of one key component. Null and blank values disqualify
/// the whole key.
fn value_to_key_part(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Arrays and objects are configuration mistakes, not identities.
        Value::Array(_) | Value::Object(_) => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(text)
}
