//! Locking session store protocol.
//!
//! Emulates one writer per session on a store with no distributed lock.
//! Each record is a hash (see [`crate::record`]); a request that reads with
//! `exclusive = true` claims the record by writing `lockId` with `HSETNX`,
//! so two requests racing for the same unlocked record cannot both win.
//! `lockedAt` and the TTL are written in the same atomic step as the claim.
//! Requests that find the record locked get [`ReadOutcome::Locked`] with
//! the holder's token and the lock's age, and no data.
//!
//! Releasing and removing compare the presented token against the stored
//! one on the store side. A mismatch is a silent no-op: the lock may have
//! been released and re-acquired by a newer request, and clearing it would
//! corrupt that request's state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kvs_core::{codec, Error, KeySpace, LockId, Result, SessionAction, SessionItems, StoreConfig};
use kvs_store::KeyValueStore;
use tracing::{debug, warn};

use crate::policy::ErrorPolicy;
use crate::provider::{ReadOutcome, SessionStateData, SessionStateStore};
use crate::record::{self, StoredRecord};

pub const PROVIDER_NAME: &str = "RedisSessionStateStore";

/// Attempts before giving up on a record whose lock keeps changing hands
/// between our read and our claim.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

pub struct LockingSessionStore {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
    timeout: Duration,
    policy: ErrorPolicy,
}

impl LockingSessionStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeySpace,
        timeout: Duration,
        write_exceptions_to_log: bool,
    ) -> Self {
        Self {
            store,
            keys,
            timeout,
            policy: ErrorPolicy::new(PROVIDER_NAME, write_exceptions_to_log),
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &StoreConfig) -> Result<Self> {
        Ok(Self::new(
            store,
            config.key_space()?,
            config.session_timeout(),
            config.write_exceptions_to_event_log,
        ))
    }

    async fn read(&self, id: &str, exclusive: bool) -> Result<ReadOutcome> {
        let key = self.keys.session(id);

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let Some(fields) = self.store.hash_get_all(&key).await? else {
                debug!(session = id, "no stored record");
                return Ok(ReadOutcome::Missing);
            };
            let record = StoredRecord::parse(fields)?;

            if let Some(lock) = record.lock {
                let lock_age = lock.age(Utc::now());
                debug!(session = id, lock_id = %lock.lock_id, ?lock_age, "record is locked");
                return Ok(ReadOutcome::Locked {
                    lock_id: lock.lock_id,
                    lock_age,
                });
            }

            if record.init_pending {
                // Whoever removes the marker owns the first-time initialization.
                if self.store.hash_delete(&key, &[record::INIT]).await? > 0 {
                    debug!(session = id, "consumed init marker");
                    return Ok(ReadOutcome::Loaded {
                        data: SessionStateData::empty(self.timeout),
                        lock_id: None,
                        action: SessionAction::InitializeItem,
                    });
                }
            }

            let Some(blob) = &record.data else {
                // A hash with no data (a lock-only leftover) reads as a fresh
                // session and is never locked.
                debug!(session = id, "record has no data");
                return Ok(ReadOutcome::Loaded {
                    data: SessionStateData::empty(self.timeout),
                    lock_id: None,
                    action: SessionAction::None,
                });
            };
            let data = SessionStateData::new(codec::deserialize(blob)?, self.timeout);

            if !exclusive {
                return Ok(ReadOutcome::Loaded {
                    data,
                    lock_id: None,
                    action: SessionAction::None,
                });
            }

            let lock_id = LockId::generate();
            if self.claim(&key, id, lock_id).await? {
                debug!(session = id, %lock_id, "acquired lock");
                return Ok(ReadOutcome::Loaded {
                    data,
                    lock_id: Some(lock_id),
                    action: SessionAction::None,
                });
            }

            debug!(session = id, attempt, "lost lock race, re-reading record");
        }

        Err(Error::Store(format!(
            "lock on session {id} changed hands {MAX_ACQUIRE_ATTEMPTS} times during acquisition"
        )))
    }

    /// Write `lockId`, `lockedAt` and the TTL in one atomic step. When the
    /// claim errors its outcome is unknown, so any lock written under this
    /// token is cleared before the error is returned.
    async fn claim(&self, key: &str, id: &str, lock_id: LockId) -> Result<bool> {
        let token = lock_id.to_field();
        let locked_at = record::encode_millis(Utc::now());
        let claimed = self
            .store
            .hash_claim(
                key,
                record::LOCK_ID,
                &token,
                &[(record::LOCKED_AT, locked_at.as_slice())],
                self.timeout,
            )
            .await;

        match claimed {
            Ok(won) => Ok(won),
            Err(e) => {
                if let Err(cleanup) = self.release(key, id, lock_id).await {
                    warn!(session = id, %lock_id, error = %cleanup, "could not clear unconfirmed lock");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, key: &str, id: &str, lock_id: LockId) -> Result<bool> {
        let released = self
            .store
            .hash_delete_if_eq(key, record::LOCK_ID, &lock_id.to_field(), &record::LOCK_FIELDS)
            .await?;
        if released {
            debug!(session = id, %lock_id, "released lock");
        } else {
            debug!(session = id, %lock_id, "lock token does not match, leaving lock in place");
        }
        Ok(released)
    }
}

#[async_trait]
impl SessionStateStore for LockingSessionStore {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    fn session_timeout(&self) -> Duration {
        self.timeout
    }

    async fn acquire_for_read(&self, id: &str, exclusive: bool) -> Result<ReadOutcome> {
        self.policy
            .run("GetSessionStoreItem", self.read(id, exclusive))
            .await
    }

    async fn release_lock(&self, id: &str, lock_id: LockId) -> Result<()> {
        self.policy
            .run("ReleaseItemExclusive", async {
                let key = self.keys.session(id);
                self.release(&key, id, lock_id).await.map(|_| ())
            })
            .await
    }

    async fn commit_and_release(
        &self,
        id: &str,
        items: &SessionItems,
        lock_id: Option<LockId>,
        is_new: bool,
    ) -> Result<()> {
        self.policy
            .run("SetAndReleaseItemExclusive", async {
                let key = self.keys.session(id);
                let blob = codec::serialize(items)?;
                if let Some(lock_id) = lock_id {
                    self.release(&key, id, lock_id).await?;
                }
                // The host holds the authoritative copy at end of request, so
                // the write goes ahead whether or not the release matched.
                self.store
                    .hash_set_with_expiry(&key, &[(record::DATA, blob.as_slice())], self.timeout)
                    .await?;
                debug!(session = id, is_new, items = items.len(), "stored session data");
                Ok(())
            })
            .await
    }

    async fn remove(&self, id: &str, lock_id: Option<LockId>) -> Result<()> {
        self.policy
            .run("RemoveItem", async {
                let Some(lock_id) = lock_id else {
                    debug!(session = id, "remove without lock token, leaving record");
                    return Ok(());
                };
                let key = self.keys.session(id);
                let removed = self
                    .store
                    .delete_if_eq(&key, record::LOCK_ID, &lock_id.to_field())
                    .await?;
                debug!(session = id, %lock_id, removed, "remove");
                Ok(())
            })
            .await
    }

    async fn refresh_timeout(&self, id: &str) -> Result<()> {
        self.policy
            .run("ResetItemTimeout", async {
                let key = self.keys.session(id);
                self.store.expire(&key, self.timeout).await.map(|_| ())
            })
            .await
    }

    async fn create_uninitialized(&self, id: &str, timeout: Duration) -> Result<()> {
        self.policy
            .run("CreateUninitializedItem", async {
                let key = self.keys.session(id);
                let blob = codec::serialize(&SessionItems::new())?;
                self.store
                    .hash_set_with_expiry(
                        &key,
                        &[(record::DATA, blob.as_slice()), (record::INIT, record::INIT_PENDING)],
                        timeout,
                    )
                    .await
            })
            .await
    }
}
