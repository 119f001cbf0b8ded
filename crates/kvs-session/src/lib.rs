pub mod locking;
pub mod non_locking;
pub mod policy;
pub mod provider;
pub mod record;

pub use locking::LockingSessionStore;
pub use non_locking::NonLockingSessionStore;
pub use policy::ErrorPolicy;
pub use provider::{ReadOutcome, SessionStateData, SessionStateStore};
