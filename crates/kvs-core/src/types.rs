use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

// ── LockId ──

/// Opaque token proving ownership of a session's exclusive lock.
///
/// A fresh token is generated for every acquisition; releasing or removing
/// a locked record requires presenting the exact token that was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(Uuid);

impl LockId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Encoding stored in the record's `lockId` field.
    pub fn to_field(&self) -> Vec<u8> {
        self.0.hyphenated().to_string().into_bytes()
    }

    pub fn from_field(raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Codec("lockId is not valid UTF-8".into()))?;
        text.parse()
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for LockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Codec(format!("invalid lock id {s:?}: {e}")))
    }
}

// ── SessionAction ──

/// What the host should do with a record it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionAction {
    #[default]
    None,
    /// The record was a placeholder written by "create uninitialized"; the
    /// host treats this read as first-time initialization.
    InitializeItem,
}

impl std::fmt::Display for SessionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::InitializeItem => "initialize_item",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_field_roundtrip() {
        let id = LockId::generate();
        let raw = id.to_field();
        assert_eq!(LockId::from_field(&raw).unwrap(), id);
        assert_eq!(String::from_utf8(raw).unwrap(), id.to_string());
    }

    #[test]
    fn lock_ids_are_unique() {
        assert_ne!(LockId::generate(), LockId::generate());
    }

    #[test]
    fn garbage_lock_field_is_codec_error() {
        assert!(matches!(LockId::from_field(b"not-a-uuid"), Err(Error::Codec(_))));
        assert!(matches!(LockId::from_field(&[0xff, 0xfe]), Err(Error::Codec(_))));
    }
}
