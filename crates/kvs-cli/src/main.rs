mod commands;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kvs_session::{LockingSessionStore, NonLockingSessionStore, SessionStateStore};
use kvs_store::{KeyValueStore, RedisStore};
use tracing_subscriber::EnvFilter;

use commands::Command;
use settings::StoreArgs;

#[derive(Parser)]
#[command(name = "kvs", version, about = "kvs: inspect and administer persisted session records")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    store: StoreArgs,

    /// Session store protocol the records were written with
    #[arg(long, global = true, value_enum, default_value_t = Mode::Locking)]
    mode: Mode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Locking,
    NonLocking,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.store.resolve()?;

    let redis = Arc::new(RedisStore::from_config(&config).context("failed to set up store")?);
    let store: Arc<dyn KeyValueStore> = redis.clone();
    let provider: Box<dyn SessionStateStore> = match cli.mode {
        Mode::Locking => Box::new(LockingSessionStore::from_config(store.clone(), &config)?),
        Mode::NonLocking => Box::new(NonLockingSessionStore::from_config(store.clone(), &config)?),
    };
    tracing::debug!(
        provider = provider.name(),
        endpoint = %config.endpoint(),
        application = provider.key_space().application(),
        "store configured"
    );

    let result = commands::run(cli.command, provider.as_ref(), store.as_ref()).await;
    redis.connections().shutdown();
    result
}
