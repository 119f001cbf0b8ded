//! In-process store backed by `DashMap`.
//!
//! Mirrors the store semantics the protocols rely on: per-key TTL,
//! collections that disappear when their last element is removed, and
//! atomic claim and compare-and-delete. Expiry is lazy and measured with
//! `tokio::time::Instant`, so paused-clock tests can advance it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kvs_core::{Error, Result};
use tokio::time::Instant;

use crate::backend::{CollectionStore, HashFields, KeyValueStore};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Text(Vec<u8>),
    Hash(HashFields),
    Set(HashSet<Vec<u8>>),
    SortedSet(HashMap<Vec<u8>, f64>),
    List(Vec<Vec<u8>>),
}

impl Value {
    fn hash() -> Self {
        Self::Hash(HashMap::new())
    }

    fn set() -> Self {
        Self::Set(HashSet::new())
    }

    fn sorted_set() -> Self {
        Self::SortedSet(HashMap::new())
    }

    fn list() -> Self {
        Self::List(Vec::new())
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::SortedSet(z) => z.is_empty(),
            Self::List(l) => l.is_empty(),
        }
    }
}

fn wrong_type() -> Error {
    Error::Store(WRONG_TYPE.into())
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn hash(&self) -> Result<&HashFields> {
        match &self.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self) -> Result<&mut HashFields> {
        match &mut self.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type()),
        }
    }

    fn is_empty_collection(&self) -> bool {
        self.value.is_empty_collection()
    }
}

/// Single-process `KeyValueStore`. Cheap to construct; not shared between
/// processes.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a live entry, dropping it first if it has expired.
    fn read<T>(&self, key: &str, f: impl FnOnce(&Entry) -> Result<T>) -> Result<Option<T>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return f(entry.value()).map(Some);
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        Ok(None)
    }

    /// Mutate a live entry in place; expired entries count as absent.
    fn update<T>(&self, key: &str, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<Option<T>> {
        let now = Instant::now();
        let result = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => Some(f(entry.value_mut())),
            _ => None,
        };
        self.entries
            .remove_if(key, |_, e| e.is_expired(now) || e.is_empty_collection());
        result.transpose()
    }

    /// Mutate an entry, creating it from `empty` (without TTL) if absent or
    /// expired.
    fn upsert<T>(
        &self,
        key: &str,
        empty: fn() -> Value,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::persistent(empty()));
        if entry.is_expired(now) {
            *entry = Entry::persistent(empty());
        }
        let result = f(entry.value_mut());
        drop(entry);
        self.entries.remove_if(key, |_, e| e.is_empty_collection());
        result
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read(key, |entry| match &entry.value {
            Value::Text(bytes) => Ok(bytes.clone()),
            _ => Err(wrong_type()),
        })
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated = self.update(key, |entry| {
            entry.expires_at = Some(Instant::now() + ttl);
            Ok(())
        })?;
        Ok(updated.is_some())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let ttl = self.read(key, |entry| {
            Ok(entry.expires_at.map(|at| at.saturating_duration_since(now)))
        })?;
        Ok(ttl.flatten())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashFields>> {
        self.read(key, |entry| entry.hash().cloned())
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<()> {
        self.upsert(key, Value::hash, |entry| {
            let hash = entry.hash_mut()?;
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.to_vec());
            }
            entry.expires_at = Some(Instant::now() + ttl);
            Ok(())
        })
    }

    async fn hash_claim(
        &self,
        key: &str,
        guard: &str,
        token: &[u8],
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<bool> {
        self.upsert(key, Value::hash, |entry| {
            let hash = entry.hash_mut()?;
            if hash.contains_key(guard) {
                return Ok(false);
            }
            hash.insert(guard.to_string(), token.to_vec());
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.to_vec());
            }
            entry.expires_at = Some(Instant::now() + ttl);
            Ok(true)
        })
    }

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<usize> {
        let removed = self.update(key, |entry| {
            let hash = entry.hash_mut()?;
            Ok(fields.iter().filter(|f| hash.remove(**f).is_some()).count())
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn hash_delete_if_eq(
        &self,
        key: &str,
        guard: &str,
        expected: &[u8],
        fields: &[&str],
    ) -> Result<bool> {
        let deleted = self.update(key, |entry| {
            let hash = entry.hash_mut()?;
            if hash.get(guard).map(Vec::as_slice) != Some(expected) {
                return Ok(false);
            }
            for field in fields {
                hash.remove(*field);
            }
            Ok(true)
        })?;
        Ok(deleted.unwrap_or(false))
    }

    async fn delete_if_eq(&self, key: &str, guard: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut mismatch = None;
        let removed = self.entries.remove_if(key, |_, entry| {
            if entry.is_expired(now) {
                return false;
            }
            match entry.hash() {
                Ok(hash) => hash.get(guard).map(Vec::as_slice) == Some(expected),
                Err(e) => {
                    mismatch = Some(e);
                    false
                }
            }
        });
        if let Some(e) = mismatch {
            return Err(e);
        }
        Ok(removed.is_some())
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let value = self.read(key, |entry| Ok(entry.hash()?.get(field).cloned()))?;
        Ok(value.flatten())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<()> {
        self.upsert(key, Value::hash, |entry| {
            let hash = entry.hash_mut()?;
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.to_vec());
            }
            Ok(())
        })
    }

    async fn set_add(&self, key: &str, members: &[&[u8]]) -> Result<usize> {
        self.upsert(key, Value::set, |entry| match &mut entry.value {
            Value::Set(set) => Ok(members.iter().filter(|m| set.insert(m.to_vec())).count()),
            _ => Err(wrong_type()),
        })
    }

    async fn set_remove(&self, key: &str, members: &[&[u8]]) -> Result<usize> {
        let removed = self.update(key, |entry| match &mut entry.value {
            Value::Set(set) => Ok(members.iter().filter(|m| set.remove(**m)).count()),
            _ => Err(wrong_type()),
        })?;
        Ok(removed.unwrap_or(0))
    }

    async fn set_contains(&self, key: &str, member: &[u8]) -> Result<bool> {
        let found = self.read(key, |entry| match &entry.value {
            Value::Set(set) => Ok(set.contains(member)),
            _ => Err(wrong_type()),
        })?;
        Ok(found.unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let members = self.read(key, |entry| match &entry.value {
            Value::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(wrong_type()),
        })?;
        Ok(members.unwrap_or_default())
    }

    async fn sorted_set_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        self.upsert(key, Value::sorted_set, |entry| match &mut entry.value {
            Value::SortedSet(scores) => Ok(scores.insert(member.to_vec(), score).is_none()),
            _ => Err(wrong_type()),
        })
    }

    async fn sorted_set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        let removed = self.update(key, |entry| match &mut entry.value {
            Value::SortedSet(scores) => Ok(scores.remove(member).is_some()),
            _ => Err(wrong_type()),
        })?;
        Ok(removed.unwrap_or(false))
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>> {
        let members = self.read(key, |entry| match &entry.value {
            Value::SortedSet(scores) => {
                let mut hits: Vec<(&Vec<u8>, f64)> = scores
                    .iter()
                    .filter(|(_, score)| (min..=max).contains(*score))
                    .map(|(member, score)| (member, *score))
                    .collect();
                hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(hits.into_iter().map(|(member, _)| member.clone()).collect())
            }
            _ => Err(wrong_type()),
        })?;
        Ok(members.unwrap_or_default())
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize> {
        self.upsert(key, Value::list, |entry| match &mut entry.value {
            Value::List(list) => {
                list.push(value.to_vec());
                Ok(list.len())
            }
            _ => Err(wrong_type()),
        })
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        let items = self.read(key, |entry| match &entry.value {
            Value::List(list) => Ok(match list_window(list.len(), start, stop) {
                Some((from, to)) => list[from..=to].to_vec(),
                None => Vec::new(),
            }),
            _ => Err(wrong_type()),
        })?;
        Ok(items.unwrap_or_default())
    }
}

/// Resolve an inclusive `LRANGE`-style window against a list of `len`.
fn list_window(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start <= stop && start < len).then(|| (start as usize, stop as usize))
}
