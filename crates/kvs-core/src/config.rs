//! Provider configuration.
//!
//! Loaded from TOML with camelCase keys; every option has a default so an
//! empty file (or no file) yields a working local configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::KeySpace;

/// Environment variable consulted when `applicationName` is not configured.
pub const APPLICATION_NAME_ENV: &str = "KVS_APPLICATION_NAME";

/// Longest accepted session timeout: one year.
pub const MAX_SESSION_TIMEOUT_MINUTES: u64 = 525_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub application_name: Option<String>,
    /// Log failures and surface a generic provider error instead of the
    /// underlying one.
    #[serde(default = "default_true")]
    pub write_exceptions_to_event_log: bool,
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_true() -> bool {
    true
}

fn default_session_timeout_minutes() -> u64 {
    20
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            application_name: None,
            write_exceptions_to_event_log: default_true(),
            session_timeout_minutes: default_session_timeout_minutes(),
            operation_timeout_ms: default_operation_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".into()));
        }
        if self.db < 0 {
            return Err(Error::Config(format!("db index {} is negative", self.db)));
        }
        if self.session_timeout_minutes == 0 {
            return Err(Error::Config("sessionTimeoutMinutes must be at least 1".into()));
        }
        if self.session_timeout_minutes > MAX_SESSION_TIMEOUT_MINUTES {
            return Err(Error::Config(format!(
                "sessionTimeoutMinutes {} exceeds {MAX_SESSION_TIMEOUT_MINUTES}",
                self.session_timeout_minutes
            )));
        }
        if self.operation_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        self.key_space().map(|_| ())
    }

    /// Configured application name, or one derived from the process
    /// environment.
    pub fn application_name(&self) -> String {
        if let Some(name) = self.application_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        if let Ok(name) = std::env::var(APPLICATION_NAME_ENV) {
            if !name.is_empty() {
                return name;
            }
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .filter(|stem| !stem.is_empty() && !stem.contains(':'))
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn key_space(&self) -> Result<KeySpace> {
        KeySpace::new(self.application_name())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `host:port/db`, for log records. Never includes the password.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }
}
