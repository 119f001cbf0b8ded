//! Non-locking session store protocol.
//!
//! Records are plain string values holding the encoded items. There is no
//! lock bookkeeping at all: exclusive and shared reads are the same single
//! `GET`, commits overwrite unconditionally, and removal never checks a
//! token. Two concurrent requests for one session therefore race and the
//! last writer wins; updates from the other request are lost. That is the
//! intended trade-off for read-mostly sessions that cannot afford a lock
//! round-trip, not a defect.
//!
//! Records written by this provider are not readable by
//! [`LockingSessionStore`](crate::locking::LockingSessionStore) and vice
//! versa; an application uses one or the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvs_core::{codec, KeySpace, LockId, Result, SessionAction, SessionItems, StoreConfig};
use kvs_store::KeyValueStore;
use tracing::debug;

use crate::policy::ErrorPolicy;
use crate::provider::{ReadOutcome, SessionStateData, SessionStateStore};

pub const PROVIDER_NAME: &str = "NonLockingRedisSessionStateStore";

pub struct NonLockingSessionStore {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
    timeout: Duration,
    policy: ErrorPolicy,
}

impl NonLockingSessionStore {
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
}

#[async_trait]
impl SessionStateStore for NonLockingSessionStore {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    fn session_timeout(&self) -> Duration {
        self.timeout
    }

    /// `exclusive` is ignored. An absent record reads as a fresh empty one.
    async fn acquire_for_read(&self, id: &str, _exclusive: bool) -> Result<ReadOutcome> {
        self.policy
            .run("GetSessionStoreItem", async {
                let key = self.keys.session(id);
                let items = match self.store.get(&key).await? {
                    Some(blob) => codec::deserialize(&blob)?,
                    None => SessionItems::new(),
                };
                Ok(ReadOutcome::Loaded {
                    data: SessionStateData::new(items, self.timeout),
                    lock_id: None,
                    action: SessionAction::None,
                })
            })
            .await
    }

    async fn release_lock(&self, _id: &str, _lock_id: LockId) -> Result<()> {
        Ok(())
    }

    async fn commit_and_release(
        &self,
        id: &str,
        items: &SessionItems,
        _lock_id: Option<LockId>,
        is_new: bool,
    ) -> Result<()> {
        self.policy
            .run("SetAndReleaseItemExclusive", async {
                let key = self.keys.session(id);
                let blob = codec::serialize(items)?;
                self.store.set_with_expiry(&key, &blob, self.timeout).await?;
                debug!(session = id, is_new, items = items.len(), "stored session data");
                Ok(())
            })
            .await
    }

    async fn remove(&self, id: &str, _lock_id: Option<LockId>) -> Result<()> {
        self.policy
            .run("RemoveItem", async {
                let key = self.keys.session(id);
                self.store.delete(&key).await.map(|_| ())
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
                self.store.set_with_expiry(&key, &blob, timeout).await
            })
            .await
    }
}
