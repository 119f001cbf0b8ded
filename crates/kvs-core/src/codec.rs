//! Session item collection and its stored blob encoding.
//!
//! A blob is a small fixed header followed by a MessagePack payload:
//!
//! ```text
//! [version: u8][payload length: u32 big-endian][payload]
//! ```
//!
//! An empty collection still produces a valid, non-empty blob. A
//! zero-length blob is accepted on read and decodes to an empty collection,
//! which keeps records written by older tooling readable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 5;

// ── SessionValue ──

/// A single value stored under a session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<SessionValue>),
    Map(BTreeMap<String, SessionValue>),
}

impl From<bool> for SessionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SessionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SessionValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for SessionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SessionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SessionValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<SessionValue>> From<Option<T>> for SessionValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ── SessionItems ──

/// The key → value collection a host keeps in session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionItems {
    items: BTreeMap<String, SessionValue>,
}

impl SessionItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.items.get(key)
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<SessionValue>,
    ) -> Option<SessionValue> {
        self.items.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.items.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SessionValue)> {
        self.items.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.items.keys()
    }
}

impl<K: Into<String>, V: Into<SessionValue>> FromIterator<(K, V)> for SessionItems {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            items: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ── Blob encoding ──

/// Encode an item collection into a stored blob.
pub fn serialize(items: &SessionItems) -> Result<Vec<u8>> {
    let payload =
        rmp_serde::to_vec(items).map_err(|e| Error::Codec(format!("encode failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Codec(format!("payload of {} bytes is too large", payload.len())))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.push(FORMAT_VERSION);
    blob.extend_from_slice(&len.to_be_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Decode a stored blob back into an item collection.
pub fn deserialize(blob: &[u8]) -> Result<SessionItems> {
    if blob.is_empty() {
        return Ok(SessionItems::new());
    }
    if blob.len() < HEADER_LEN {
        return Err(Error::Codec(format!(
            "blob of {} bytes is shorter than its header",
            blob.len()
        )));
    }
    if blob[0] != FORMAT_VERSION {
        return Err(Error::Codec(format!("unknown format version {}", blob[0])));
    }

    let declared = u32::from_be_bytes([blob[1], blob[2], blob[3], blob[4]]) as usize;
    let payload = &blob[HEADER_LEN..];
    if payload.len() != declared {
        return Err(Error::Codec(format!(
            "payload length {} does not match header ({declared})",
            payload.len()
        )));
    }

    rmp_serde::from_slice(payload).map_err(|e| Error::Codec(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionItems {
        let mut nested = BTreeMap::new();
        nested.insert("depth".to_string(), SessionValue::Int(2));
        nested.insert("tags".to_string(), SessionValue::List(vec!["a".into(), "b".into()]));

        let mut items = SessionItems::new();
        items.insert("user", "alice");
        items.insert("visits", 42i64);
        items.insert("ratio", 0.25f64);
        items.insert("admin", false);
        items.insert("avatar", vec![0u8, 1, 2, 255]);
        items.insert("missing", SessionValue::Null);
        items.insert("prefs", SessionValue::Map(nested));
        items
    }

    #[test]
    fn roundtrip_preserves_types_and_payloads() {
        let items = sample();
        let blob = serialize(&items).unwrap();
        let back = deserialize(&blob).unwrap();
        assert_eq!(back, items);
        assert_eq!(back.get("visits"), Some(&SessionValue::Int(42)));
        assert_eq!(back.get("ratio"), Some(&SessionValue::Float(0.25)));
        assert_eq!(back.get("avatar"), Some(&SessionValue::Bytes(vec![0, 1, 2, 255])));
    }

    #[test]
    fn empty_collection_is_valid_nonempty_blob() {
        let blob = serialize(&SessionItems::new()).unwrap();
        assert!(blob.len() > HEADER_LEN);
        assert!(deserialize(&blob).unwrap().is_empty());
    }

    #[test]
    fn zero_length_blob_is_empty_collection() {
        assert!(deserialize(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(deserialize(&[FORMAT_VERSION, 0]), Err(Error::Codec(_))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut blob = serialize(&sample()).unwrap();
        blob[0] = 9;
        assert!(matches!(deserialize(&blob), Err(Error::Codec(_))));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut blob = serialize(&sample()).unwrap();
        blob.truncate(blob.len() - 3);
        assert!(matches!(deserialize(&blob), Err(Error::Codec(_))));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let mut blob = vec![FORMAT_VERSION];
        blob.extend_from_slice(&3u32.to_be_bytes());
        blob.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        assert!(matches!(deserialize(&blob), Err(Error::Codec(_))));
    }

    #[test]
    fn items_collect_from_pairs() {
        let items: SessionItems = [("k", "v"), ("x", "y")].into_iter().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items.get("k"), Some(&SessionValue::Text("v".into())));
        assert_eq!(items.keys().collect::<Vec<_>>(), ["k", "x"]);
    }
}
