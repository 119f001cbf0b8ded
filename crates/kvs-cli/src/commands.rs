use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use kvs_core::{LockId, SessionItems, MAX_SESSION_TIMEOUT_MINUTES};
use kvs_session::{ReadOutcome, SessionStateStore};
use kvs_store::KeyValueStore;
use serde::Serialize;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read a session record
    Inspect {
        /// Session id
        id: String,
        /// Take the lock as a request would (locking mode only)
        #[arg(long)]
        exclusive: bool,
    },

    /// Write a placeholder record that the next read initializes
    Create {
        /// Session id
        id: String,
        /// Record timeout in minutes (defaults to the session timeout)
        #[arg(long)]
        minutes: Option<u64>,
    },

    /// Store items and release the lock, as at the end of a request
    Set {
        /// Session id
        id: String,
        /// Items as key=value; values are stored as text
        #[arg(required = true)]
        items: Vec<String>,
        /// Lock token to release
        #[arg(long)]
        lock_id: Option<LockId>,
        /// Merge into the stored items instead of replacing them
        #[arg(long)]
        merge: bool,
    },

    /// Reset a record's timeout
    Touch {
        /// Session id
        id: String,
    },

    /// Release a lock held under the given token
    Release {
        /// Session id
        id: String,
        /// Lock token
        lock_id: LockId,
    },

    /// Remove a record
    Remove {
        /// Session id
        id: String,
        /// Lock token (locking mode ignores removal without it)
        #[arg(long)]
        lock_id: Option<LockId>,
    },
}

#[derive(Serialize, Debug)]
#[serde(tag = "status", rename_all = "camelCase")]
enum OutcomeView<'a> {
    Missing,
    #[serde(rename_all = "camelCase")]
    Locked { lock_id: LockId, lock_age_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Loaded {
        lock_id: Option<LockId>,
        initialize: bool,
        ttl_secs: Option<u64>,
        items: &'a SessionItems,
    },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Ack<'a> {
    provider: &'a str,
    key: String,
    op: &'static str,
}

pub async fn run(
    command: Command,
    provider: &dyn SessionStateStore,
    store: &dyn KeyValueStore,
) -> Result<()> {
    match command {
        Command::Inspect { id, exclusive } => inspect(provider, store, &id, exclusive).await,
        Command::Create { id, minutes } => {
            let timeout = match minutes {
                Some(m) => record_timeout(m)?,
                None => provider.session_timeout(),
            };
            provider.create_uninitialized(&id, timeout).await?;
            ack(provider, &id, "create")
        }
        Command::Set {
            id,
            items,
            lock_id,
            merge,
        } => {
            let updates = parse_items(&items)?;
            let (mut stored, is_new) = if merge {
                let outcome = provider.get_item(&id).await?;
                if outcome.is_locked() {
                    bail!("session {id} is locked; release it or pass --lock-id without --merge");
                }
                let is_new = outcome == ReadOutcome::Missing;
                let data = outcome.into_data().map(|d| d.items).unwrap_or_default();
                (data, is_new)
            } else {
                (SessionItems::new(), false)
            };
            for (key, value) in updates.iter() {
                stored.insert(key.clone(), value.clone());
            }
            provider.commit_and_release(&id, &stored, lock_id, is_new).await?;
            ack(provider, &id, "set")
        }
        Command::Touch { id } => {
            provider.refresh_timeout(&id).await?;
            ack(provider, &id, "touch")
        }
        Command::Release { id, lock_id } => {
            provider.release_lock(&id, lock_id).await?;
            ack(provider, &id, "release")
        }
        Command::Remove { id, lock_id } => {
            provider.remove(&id, lock_id).await?;
            ack(provider, &id, "remove")
        }
    }
}

async fn inspect(
    provider: &dyn SessionStateStore,
    store: &dyn KeyValueStore,
    id: &str,
    exclusive: bool,
) -> Result<()> {
    let outcome = provider.acquire_for_read(id, exclusive).await?;
    let ttl = match outcome {
        ReadOutcome::Loaded { .. } => {
            store.time_to_live(&provider.key_space().session(id)).await?
        }
        _ => None,
    };

    let view = match &outcome {
        ReadOutcome::Missing => OutcomeView::Missing,
        ReadOutcome::Locked { lock_id, lock_age } => OutcomeView::Locked {
            lock_id: *lock_id,
            lock_age_ms: lock_age.as_millis() as u64,
        },
        ReadOutcome::Loaded {
            data,
            lock_id,
            action,
        } => OutcomeView::Loaded {
            lock_id: *lock_id,
            initialize: *action == kvs_core::SessionAction::InitializeItem,
            ttl_secs: ttl.map(|t| t.as_secs()),
            items: &data.items,
        },
    };
    print_json(&view)
}

fn ack(provider: &dyn SessionStateStore, id: &str, op: &'static str) -> Result<()> {
    print_json(&Ack {
        provider: provider.name(),
        key: provider.key_space().session(id),
        op,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{out}");
    Ok(())
}

fn record_timeout(minutes: u64) -> Result<Duration> {
    if minutes == 0 || minutes > MAX_SESSION_TIMEOUT_MINUTES {
        bail!("--minutes must be between 1 and {MAX_SESSION_TIMEOUT_MINUTES}, got {minutes}");
    }
    Ok(Duration::from_secs(minutes * 60))
}

fn parse_items(raw: &[String]) -> Result<SessionItems> {
    raw.iter()
        .map(|pair| -> Result<(String, String)> {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("expected key=value, got {pair:?}"))?;
            if key.is_empty() {
                bail!("empty key in {pair:?}");
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
