use std::time::Duration;

use thiserror::Error;

/// Message surfaced to hosts when failures are logged instead of exposed.
pub const PROVIDER_ERROR_MESSAGE: &str = "An exception occurred. Please check the log.";

#[derive(Error, Debug)]
pub enum Error {
    #[error("backing store connection failed: {0}")]
    Connection(String),

    #[error("backing store error: {0}")]
    Store(String),

    #[error("backing store operation {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("malformed session record: {0}")]
    Codec(String),

    #[error("{PROVIDER_ERROR_MESSAGE}")]
    Provider,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for failures of the transport itself, as opposed to a command
    /// the store rejected.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
