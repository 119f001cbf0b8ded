use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use kvs_core::StoreConfig;

/// Store connection flags. Each one overrides the matching key of the
/// config file.
#[derive(Args, Debug, Default, Clone)]
pub struct StoreArgs {
    /// TOML config file (camelCase keys, all optional)
    #[arg(long, global = true, env = "KVS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Redis host
    #[arg(long, global = true, env = "KVS_HOST")]
    pub host: Option<String>,

    /// Redis port
    #[arg(long, global = true, env = "KVS_PORT")]
    pub port: Option<u16>,

    /// Redis database index
    #[arg(long, global = true, env = "KVS_DB")]
    pub db: Option<i64>,

    /// Redis password
    #[arg(long, global = true, env = "KVS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Application name used in key derivation
    #[arg(long, global = true)]
    pub application: Option<String>,

    /// Session timeout in minutes
    #[arg(long, global = true)]
    pub timeout_minutes: Option<u64>,

    /// Connect timeout in milliseconds
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,

    /// Report the underlying store error instead of the generic provider
    /// error
    #[arg(long, global = true)]
    pub raw_errors: bool,
}

impl StoreArgs {
    /// Load the config file (if any), apply flag overrides and validate.
    pub fn resolve(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => StoreConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => StoreConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid store settings")?;
        Ok(config)
    }

    fn apply(&self, config: &mut StoreConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(db) = self.db {
            config.db = db;
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(application) = &self.application {
            config.application_name = Some(application.clone());
        }
        if let Some(minutes) = self.timeout_minutes {
            config.session_timeout_minutes = minutes;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout_ms = ms;
        }
        if self.raw_errors {
            config.write_exceptions_to_event_log = false;
        }
    }
}
