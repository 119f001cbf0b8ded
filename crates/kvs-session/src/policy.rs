//! Failure handling at the provider boundary.

use std::future::Future;

use kvs_core::{Error, Result};
use tracing::{debug, error};

/// Decides what a host sees when a store operation fails.
///
/// With `log_and_wrap` set, failures are logged with their full detail and
/// the host receives [`Error::Provider`]. Otherwise the underlying error is
/// returned unchanged.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPolicy {
    provider: &'static str,
    log_and_wrap: bool,
}

impl ErrorPolicy {
    pub fn new(provider: &'static str, log_and_wrap: bool) -> Self {
        Self {
            provider,
            log_and_wrap,
        }
    }

    pub fn logs_and_wraps(&self) -> bool {
        self.log_and_wrap
    }

    /// Await `operation` and apply the policy to its error, if any.
    pub async fn run<T, F>(&self, action: &'static str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        operation.await.map_err(|e| self.surface(action, e))
    }

    pub fn surface(&self, action: &'static str, err: Error) -> Error {
        if !self.log_and_wrap {
            debug!(provider = self.provider, action, error = %err, "session store operation failed");
            return err;
        }
        error!(
            provider = self.provider,
            action,
            error = %err,
            "session store operation failed"
        );
        Error::Provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wraps_when_enabled() {
        let policy = ErrorPolicy::new("Test", true);
        let result: Result<()> = policy
            .run("op", async { Err(Error::Codec("bad".into())) })
            .await;
        assert!(matches!(result, Err(Error::Provider)));
    }

    #[tokio::test]
    async fn propagates_when_disabled() {
        let policy = ErrorPolicy::new("Test", false);
        let result: Result<()> = policy
            .run("op", async { Err(Error::Codec("bad".into())) })
            .await;
        assert!(matches!(result, Err(Error::Codec(msg)) if msg == "bad"));
    }

    #[tokio::test]
    async fn passes_success_through() {
        let policy = ErrorPolicy::new("Test", true);
        assert_eq!(policy.run("op", async { Ok(7) }).await.unwrap(), 7);
    }
}
