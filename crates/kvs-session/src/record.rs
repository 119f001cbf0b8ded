//! Field layout of a locking session record.
//!
//! A record is a hash with these fields:
//!
//! | field      | content                                  |
//! |------------|------------------------------------------|
//! | `data`     | encoded item collection                  |
//! | `lockId`   | hyphenated UUID of the current lock      |
//! | `lockedAt` | decimal unix milliseconds of acquisition |
//! | `init`     | `1` while the record is a placeholder    |

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kvs_core::{LockId, Result};
use kvs_store::HashFields;
use tracing::warn;

pub const DATA: &str = "data";
pub const LOCK_ID: &str = "lockId";
pub const LOCKED_AT: &str = "lockedAt";
pub const INIT: &str = "init";

/// Fields cleared when a lock is released.
pub const LOCK_FIELDS: [&str; 2] = [LOCK_ID, LOCKED_AT];

pub const INIT_PENDING: &[u8] = b"1";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredLock {
    pub lock_id: LockId,
    /// Missing or unreadable only for locks written by another client;
    /// the age then reads as zero.
    pub locked_at: Option<DateTime<Utc>>,
}

impl StoredLock {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        self.locked_at
            .and_then(|at| now.signed_duration_since(at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Decoded view of a record's fields. Data stays encoded until needed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub data: Option<Vec<u8>>,
    pub lock: Option<StoredLock>,
    pub init_pending: bool,
}

impl StoredRecord {
    pub fn parse(mut fields: HashFields) -> Result<Self> {
        let lock = match fields.remove(LOCK_ID) {
            Some(raw) => Some(StoredLock {
                lock_id: LockId::from_field(&raw)?,
                locked_at: fields.remove(LOCKED_AT).and_then(|raw| parse_millis(&raw)),
            }),
            None => None,
        };
        let init_pending = fields
            .remove(INIT)
            .is_some_and(|raw| raw == INIT_PENDING || raw.eq_ignore_ascii_case(b"true"));

        Ok(Self {
            data: fields.remove(DATA),
            lock,
            init_pending,
        })
    }
}

pub fn encode_millis(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_millis().to_string().into_bytes()
}

fn parse_millis(raw: &[u8]) -> Option<DateTime<Utc>> {
    let parsed = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    if parsed.is_none() {
        warn!(raw = %String::from_utf8_lossy(raw), "ignoring malformed lockedAt field");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvs_core::Error;

    fn fields(pairs: &[(&str, &[u8])]) -> HashFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn parses_locked_record() {
        let lock_id = LockId::generate();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let record = StoredRecord::parse(fields(&[
            (DATA, b"blob".as_slice()),
            (LOCK_ID, lock_id.to_field().as_slice()),
            (LOCKED_AT, encode_millis(at).as_slice()),
        ]))
        .unwrap();

        let lock = record.lock.unwrap();
        assert_eq!(lock.lock_id, lock_id);
        assert_eq!(lock.locked_at, Some(at));
        assert_eq!(lock.age(at + chrono::TimeDelta::seconds(3)), Duration::from_secs(3));
        assert_eq!(record.data.as_deref(), Some(b"blob".as_slice()));
        assert!(!record.init_pending);
    }

    #[test]
    fn missing_or_future_locked_at_has_zero_age() {
        let lock_id = LockId::generate();
        let record = StoredRecord::parse(fields(&[(LOCK_ID, lock_id.to_field().as_slice())])).unwrap();
        let lock = record.lock.unwrap();
        assert_eq!(lock.locked_at, None);
        assert_eq!(lock.age(Utc::now()), Duration::ZERO);

        let future = StoredLock {
            lock_id,
            locked_at: Some(Utc::now() + chrono::TimeDelta::hours(1)),
        };
        assert_eq!(future.age(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn init_marker() {
        let record = StoredRecord::parse(fields(&[(DATA, b"".as_slice()), (INIT, INIT_PENDING)]))
            .unwrap();
        assert!(record.init_pending);
        assert!(record.lock.is_none());
    }

    #[test]
    fn corrupt_lock_id_is_codec_error() {
        let err = StoredRecord::parse(fields(&[(LOCK_ID, b"xyz".as_slice())])).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }
}
