pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod types;

pub use codec::{SessionItems, SessionValue};
pub use config::{StoreConfig, MAX_SESSION_TIMEOUT_MINUTES};
pub use error::{Error, Result};
pub use keys::KeySpace;
pub use types::{LockId, SessionAction};
