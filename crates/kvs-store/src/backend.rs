//! Backing key-value store abstraction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kvs_core::Result;

/// All fields of a hash value.
pub type HashFields = HashMap<String, Vec<u8>>;

/// The subset of store primitives the session protocols are built on.
///
/// Hash reads return `None` for absent keys; an existing hash always has at
/// least one field. The claim and compare-and-delete operations are atomic
/// on the store side.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite a string value and its TTL in one step.
    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns true when the key existed and now carries the new TTL.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining TTL; `None` for absent keys or keys without expiry.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>>;

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashFields>>;

    /// Set fields and refresh the key's TTL atomically.
    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<()>;

    /// Claim `guard` for `token` if the hash does not already have it. The
    /// winning call also sets `fields` and refreshes the key's TTL, in the
    /// same atomic step. Returns true when this call made the claim; a
    /// losing call changes nothing.
    async fn hash_claim(
        &self,
        key: &str,
        guard: &str,
        token: &[u8],
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<bool>;

    /// Returns the number of fields removed.
    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<usize>;

    /// Delete `fields` only if `guard` currently holds `expected`.
    async fn hash_delete_if_eq(
        &self,
        key: &str,
        guard: &str,
        expected: &[u8],
        fields: &[&str],
    ) -> Result<bool>;

    /// Delete the whole key only if hash field `guard` holds `expected`.
    async fn delete_if_eq(&self, key: &str, guard: &str, expected: &[u8]) -> Result<bool>;
}

/// Plain hash, set, sorted-set and list primitives for the records that
/// live next to sessions in the same key space (users, counters, online
/// markers, roles). None of these carry a TTL.
#[async_trait]
pub trait CollectionStore: KeyValueStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    /// Set fields without touching the key's TTL.
    async fn hash_set(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<()>;

    /// Returns the number of members that were not already present.
    async fn set_add(&self, key: &str, members: &[&[u8]]) -> Result<usize>;

    /// Returns the number of members removed.
    async fn set_remove(&self, key: &str, members: &[&[u8]]) -> Result<usize>;

    async fn set_contains(&self, key: &str, member: &[u8]) -> Result<bool>;

    /// Members in no particular order; empty for an absent key.
    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Add or rescore `member`. Returns true when it was newly added.
    async fn sorted_set_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool>;

    async fn sorted_set_remove(&self, key: &str, member: &[u8]) -> Result<bool>;

    /// Members with `min <= score <= max`, ordered by score then member.
    async fn sorted_set_range_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<Vec<u8>>>;

    /// Append to the tail. Returns the new length.
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize>;

    /// Inclusive range; negative indices count from the tail.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>>;
}
