//! Value codec for everything persisted in Redis.
//!
//! All values are self-describing JSON documents. Dates round-trip as ISO-8601
//! strings (chrono serde), integers as integers. Legacy records written by
//! earlier deployments may hold a bare string where a structured document is
//! expected; [`decode_tolerant`] falls back to the string interpretation so
//! readers survive mixed-format data, and the caller rewrites the canonical
//! form on next update.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to its persisted JSON byte form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("failed to serialize value")
}

/// Deserialize a persisted value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).context("failed to deserialize value")
}

/// Deserialize a persisted value, tolerating legacy string-form records.
///
/// Two legacy shapes are accepted when the direct decode fails:
/// - a double-encoded record: a JSON string whose content is the document
///   itself (`"{\"id\":...}"`)
/// - raw text that was never JSON-encoded, re-read as the JSON string form
///   of that text (`running` where `"running"` was expected)
///
/// Callers keep the canonical form converging by rewriting the record on
/// their next update.
pub fn decode_tolerant<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            if let Ok(inner) = serde_json::from_slice::<String>(bytes) {
                if let Ok(value) = serde_json::from_str(&inner) {
                    return Ok(value);
                }
            }
            let raw = std::str::from_utf8(bytes)
                .with_context(|| format!("value is neither JSON nor UTF-8: {}", first_err))?;
            serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .with_context(|| format!("legacy string fallback failed: {}", first_err))
        }
    }
}
