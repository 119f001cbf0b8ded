pub mod backend;
pub mod connection;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use backend::{CollectionStore, HashFields, KeyValueStore};
pub use connection::{ConnectionHandle, ConnectionState, Connector, SharedConnection};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisConnector, RedisStore};
