//! JSON<->CBOR transcoding with dictionary key substitution.
//!
//! One call consumes exactly one top-level value. Object keys found in the
//! [`KeyDictionary`](crate::dict::KeyDictionary) travel as CBOR integers;
//! everything else is preserved structurally. The codec is schema-agnostic
//! on purpose: it must round-trip arbitrary Matrix payloads.
//!
//! In canonical mode the CBOR side is deterministically encoded (map entries
//! sorted by the byte order of their encoded keys, RFC 8949 §4.2.1) and the
//! JSON side is Matrix canonical JSON (sorted object keys, no insignificant
//! whitespace).

use std::sync::Arc;

use base64::Engine;
use ciborium::value::Value as CborValue;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::dict::KeyDictionary;
use crate::{GatewayError, Metrics, Result};

/// Bidirectional JSON<->CBOR transcoder.
#[derive(Clone)]
pub struct Codec {
    dict: Arc<KeyDictionary>,
    canonical: bool,
    metrics: Arc<Metrics>,
}

impl Codec {
    pub fn new(dict: Arc<KeyDictionary>, canonical: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            dict,
            canonical,
            metrics,
        }
    }

    /// Codec over the v1 Matrix dictionary.
    pub fn v1(canonical: bool, metrics: Arc<Metrics>) -> Self {
        Self::new(KeyDictionary::v1(), canonical, metrics)
    }

    /// Transcode one JSON value to CBOR bytes.
    pub fn json_to_cbor(&self, json: &[u8]) -> Result<Vec<u8>> {
        let value: JsonValue = serde_json::from_slice(json)
            .map_err(|e| GatewayError::Transcode(format!("invalid JSON: {e}")))?;
        let mut cbor = self.json_value_to_cbor(&value);
        if self.canonical {
            sort_deterministic(&mut cbor)?;
        }
        encode_cbor(&cbor)
    }

    /// Transcode one CBOR value to JSON bytes.
    ///
    /// `serde_json` maps are key-ordered, so the output is already in
    /// Matrix canonical form (sorted keys, compact separators).
    pub fn cbor_to_json(&self, cbor: &[u8]) -> Result<Vec<u8>> {
        let value: CborValue = ciborium::from_reader(cbor)
            .map_err(|e| GatewayError::Transcode(format!("invalid CBOR: {e}")))?;
        let json = self.cbor_value_to_json(&value);
        serde_json::to_vec(&json).map_err(|e| GatewayError::Transcode(e.to_string()))
    }

    fn json_value_to_cbor(&self, value: &JsonValue) -> CborValue {
        match value {
            JsonValue::Null => CborValue::Null,
            JsonValue::Bool(b) => CborValue::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CborValue::Integer(i.into())
                } else if let Some(u) = n.as_u64() {
                    CborValue::Integer(u.into())
                } else {
                    CborValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => CborValue::Text(s.clone()),
            JsonValue::Array(items) => {
                CborValue::Array(items.iter().map(|v| self.json_value_to_cbor(v)).collect())
            }
            JsonValue::Object(entries) => {
                let map = entries
                    .iter()
                    .map(|(key, v)| {
                        let key = match self.dict.encode(key) {
                            Some(n) => CborValue::Integer(n.into()),
                            None => CborValue::Text(key.clone()),
                        };
                        (key, self.json_value_to_cbor(v))
                    })
                    .collect();
                CborValue::Map(map)
            }
        }
    }

    fn cbor_value_to_json(&self, value: &CborValue) -> JsonValue {
        match value {
            CborValue::Null => JsonValue::Null,
            CborValue::Bool(b) => JsonValue::Bool(*b),
            CborValue::Integer(i) => integer_to_json(i128::from(*i)),
            CborValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or_else(|| {
                    warn!(value = *f, "non-finite float has no JSON form");
                    JsonValue::Null
                }),
            CborValue::Text(s) => JsonValue::String(s.clone()),
            CborValue::Bytes(b) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            CborValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.cbor_value_to_json(v)).collect())
            }
            CborValue::Tag(_, inner) => self.cbor_value_to_json(inner),
            CborValue::Map(entries) => self.cbor_map_to_json(entries),
            _ => {
                warn!("unsupported CBOR value dropped to null");
                JsonValue::Null
            }
        }
    }

    /// Materialize a CBOR map as a JSON object.
    ///
    /// Integer keys are resolved and written first; string keys are written
    /// second and overwrite any integer-resolved entry that collided. This
    /// implements the "string key MUST be used" rule.
    fn cbor_map_to_json(&self, entries: &[(CborValue, CborValue)]) -> JsonValue {
        let mut object = serde_json::Map::new();
        for (key, value) in entries {
            if let CborValue::Integer(i) = key {
                let i = i128::from(*i);
                let name = u64::try_from(i)
                    .ok()
                    .and_then(|n| self.dict.decode(n))
                    .map(str::to_string)
                    .unwrap_or_else(|| i.to_string());
                object.insert(name, self.cbor_value_to_json(value));
            }
        }
        for (key, value) in entries {
            let name = match key {
                CborValue::Integer(_) => continue,
                CborValue::Text(s) => s.clone(),
                CborValue::Bool(b) => b.to_string(),
                CborValue::Float(f) => f.to_string(),
                other => {
                    self.metrics
                        .dropped_keys
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!(key = ?other, "dropping unsupported CBOR map key");
                    continue;
                }
            };
            object.insert(name, self.cbor_value_to_json(value));
        }
        JsonValue::Object(object)
    }
}

fn integer_to_json(i: i128) -> JsonValue {
    if let Ok(n) = i64::try_from(i) {
        JsonValue::Number(n.into())
    } else if let Ok(n) = u64::try_from(i) {
        JsonValue::Number(n.into())
    } else {
        // Out of JSON integer range; lose precision rather than the value.
        serde_json::Number::from_f64(i as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn encode_cbor(value: &CborValue) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| GatewayError::Transcode(format!("CBOR encoding failed: {e}")))?;
    Ok(bytes)
}

/// Recursively sort map entries by the byte order of their encoded keys.
fn sort_deterministic(value: &mut CborValue) -> Result<()> {
    match value {
        CborValue::Array(items) => {
            for item in items {
                sort_deterministic(item)?;
            }
        }
        CborValue::Tag(_, inner) => sort_deterministic(inner)?,
        CborValue::Map(entries) => {
            for (key, val) in entries.iter_mut() {
                sort_deterministic(key)?;
                sort_deterministic(val)?;
            }
            let mut keyed = Vec::with_capacity(entries.len());
            for pair in entries.drain(..) {
                keyed.push((encode_cbor(&pair.0)?, pair));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            entries.extend(keyed.into_iter().map(|(_, pair)| pair));
        }
        _ => {}
    }
    Ok(())
}
