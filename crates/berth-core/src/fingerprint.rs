//! Content fingerprints for build stages.
//!
//! A fingerprint is the SHA-256 of the canonical JSON encoding of a value:
//! object keys sorted by UTF-16 code units, compact separators. Map ordering
//! in a descriptor therefore never changes a stage's fingerprint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BerthError, Result};

/// SHA-256 hex digest used as a cache key.
///
/// The inner string is always 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Hash the canonical JSON form of `value`.
    pub fn of_json(value: &serde_json::Value) -> Result<Self> {
        let canonical = canonical_json(value)?;
        Ok(Self::from_bytes(canonical.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = BerthError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BerthError::Storage(format!("invalid fingerprint: {s}")));
        }
        Ok(Fingerprint(s.to_ascii_lowercase()))
    }
}

impl FromStr for Fingerprint {
    type Err = BerthError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Compact JSON with recursively sorted object keys. Array order is kept.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(&sort_keys_utf16(value))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_64_hex_chars() {
        let fp = Fingerprint::from_bytes(b"hello");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_key_order_does_not_change_fingerprint() {
        let a = json!({ "stage": "deps", "inputs": { "a": "1", "b": "2" } });
        let b = json!({ "inputs": { "b": "2", "a": "1" }, "stage": "deps" });
        assert_eq!(
            Fingerprint::of_json(&a).unwrap(),
            Fingerprint::of_json(&b).unwrap()
        );
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = json!({ "command": ["make", "all"] });
        let b = json!({ "command": ["all", "make"] });
        assert_ne!(
            Fingerprint::of_json(&a).unwrap(),
            Fingerprint::of_json(&b).unwrap()
        );
    }

    #[test]
    fn test_canonical_json_is_compact_and_sorted() {
        let v = json!({ "z": 1, "a": { "y": true, "b": null } });
        assert_eq!(
            canonical_json(&v).unwrap(),
            r#"{"a":{"b":null,"y":true},"z":1}"#
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("xyz".parse::<Fingerprint>().is_err());
        assert!("ab".repeat(31).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_parse_normalises_case() {
        let fp = Fingerprint::from_bytes(b"case");
        let upper = fp.as_str().to_ascii_uppercase();
        assert_eq!(upper.parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let fp = Fingerprint::from_bytes(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
        assert!(serde_json::from_str::<Fingerprint>("\"nope\"").is_err());
    }
}
