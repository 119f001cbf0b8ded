//! Trait abstraction for session state providers.
//!
//! Allows swapping between the locking and non-locking protocols behind one
//! host-facing interface.

use std::time::Duration;

use async_trait::async_trait;
use kvs_core::{KeySpace, LockId, Result, SessionAction, SessionItems};

/// A session record as handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStateData {
    pub items: SessionItems,
    pub timeout: Duration,
}

impl SessionStateData {
    pub fn new(items: SessionItems, timeout: Duration) -> Self {
        Self { items, timeout }
    }

    pub fn empty(timeout: Duration) -> Self {
        Self::new(SessionItems::new(), timeout)
    }
}

/// Result of asking a provider for a session record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// No record stored under this id.
    Missing,
    /// Another request holds the lock. Data is withheld; the host retries
    /// later or, once `lock_age` exceeds its own limit, releases `lock_id`.
    Locked { lock_id: LockId, lock_age: Duration },
    /// The record's data. `lock_id` is set when this read acquired the lock.
    Loaded {
        data: SessionStateData,
        lock_id: Option<LockId>,
        action: SessionAction,
    },
}

impl ReadOutcome {
    /// True when the read was refused because of lock contention.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// True when this read acquired the lock.
    pub fn holds_lock(&self) -> bool {
        matches!(self, Self::Loaded { lock_id: Some(_), .. })
    }

    /// The contending lock's token, or the token this read acquired.
    pub fn lock_id(&self) -> Option<LockId> {
        match self {
            Self::Missing => None,
            Self::Locked { lock_id, .. } => Some(*lock_id),
            Self::Loaded { lock_id, .. } => *lock_id,
        }
    }

    pub fn lock_age(&self) -> Duration {
        match self {
            Self::Locked { lock_age, .. } => *lock_age,
            _ => Duration::ZERO,
        }
    }

    pub fn action(&self) -> SessionAction {
        match self {
            Self::Loaded { action, .. } => *action,
            _ => SessionAction::None,
        }
    }

    pub fn data(&self) -> Option<&SessionStateData> {
        match self {
            Self::Loaded { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<SessionStateData> {
        match self {
            Self::Loaded { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Host-facing session state provider.
///
/// Implementations catch store failures at this boundary and apply their
/// [`ErrorPolicy`](crate::policy::ErrorPolicy).
#[async_trait]
pub trait SessionStateStore: Send + Sync + 'static {
    /// Name used in log records.
    fn name(&self) -> &'static str;

    fn key_space(&self) -> &KeySpace;

    /// TTL applied on writes and refreshes.
    fn session_timeout(&self) -> Duration;

    async fn acquire_for_read(&self, id: &str, exclusive: bool) -> Result<ReadOutcome>;

    async fn release_lock(&self, id: &str, lock_id: LockId) -> Result<()>;

    async fn commit_and_release(
        &self,
        id: &str,
        items: &SessionItems,
        lock_id: Option<LockId>,
        is_new: bool,
    ) -> Result<()>;

    async fn remove(&self, id: &str, lock_id: Option<LockId>) -> Result<()>;

    async fn refresh_timeout(&self, id: &str) -> Result<()>;

    async fn create_uninitialized(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Shared read.
    async fn get_item(&self, id: &str) -> Result<ReadOutcome> {
        self.acquire_for_read(id, false).await
    }

    /// Read that also takes the lock, where the protocol has one.
    async fn get_item_exclusive(&self, id: &str) -> Result<ReadOutcome> {
        self.acquire_for_read(id, true).await
    }

    /// An empty record for a new session. Does not touch the store.
    fn create_new_store_data(&self, timeout: Duration) -> SessionStateData {
        SessionStateData::empty(timeout)
    }

    /// Expiry is passive and store-driven; no provider reports it.
    fn supports_expire_callback(&self) -> bool {
        false
    }
}
