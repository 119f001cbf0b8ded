//! Redis-backed store.
//!
//! Available only when the `redis` cargo feature is enabled. Commands run
//! on a multiplexed connection owned by a [`SharedConnection`]; transport
//! failures are reported back to the handle so the next caller reconnects.
//! The lock claim and compare-and-delete run as Lua scripts so the check
//! and the write cannot interleave with another client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvs_core::{Error, Result, StoreConfig};
use redis::aio::MultiplexedConnection;
use redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError,
    RedisResult, Script,
};

use crate::backend::{CollectionStore, HashFields, KeyValueStore};
use crate::connection::{Connector, SharedConnection};

/// KEYS[1] hash; ARGV[1] guard field; ARGV[2] token; ARGV[3] ttl seconds;
/// ARGV[4..] field/value pairs written only when the claim wins.
const HASH_CLAIM: &str = r"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
for i = 4, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[3])
return 1
";

/// KEYS[1] hash; ARGV[1] guard field; ARGV[2] expected; ARGV[3..] fields.
const HASH_DELETE_IF_EQ: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HDEL', KEYS[1], unpack(ARGV, 3))
  return 1
end
return 0
";

/// KEYS[1] hash; ARGV[1] guard field; ARGV[2] expected.
const DELETE_IF_EQ: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

// ── RedisConnector ───────────────────────────────────────────────────

pub struct RedisConnector {
    client: Client,
    endpoint: String,
}

impl RedisConnector {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = Client::open(info)
            .map_err(|e| Error::Connection(format!("invalid endpoint {}: {e}", config.endpoint())))?;
        Ok(Self {
            client,
            endpoint: config.endpoint(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }
}

// ── RedisStore ───────────────────────────────────────────────────────

pub struct RedisStore {
    connections: Arc<SharedConnection<RedisConnector>>,
    op_timeout: Duration,
    hash_claim: Script,
    hash_delete_if_eq: Script,
    delete_if_eq: Script,
}

impl RedisStore {
    pub fn new(connections: Arc<SharedConnection<RedisConnector>>, op_timeout: Duration) -> Self {
        Self {
            connections,
            op_timeout,
            hash_claim: Script::new(HASH_CLAIM),
            hash_delete_if_eq: Script::new(HASH_DELETE_IF_EQ),
            delete_if_eq: Script::new(DELETE_IF_EQ),
        }
    }

    /// Build the connector and shared connection described by `config`.
    /// Nothing is opened until the first command.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let connector = RedisConnector::new(config)?;
        let connections = SharedConnection::new(
            connector,
            config.connect_timeout(),
            config.write_exceptions_to_event_log,
        );
        Ok(Self::new(Arc::new(connections), config.operation_timeout()))
    }

    pub fn connections(&self) -> &Arc<SharedConnection<RedisConnector>> {
        &self.connections
    }

    /// Run one command against the shared connection. Waiting for another
    /// caller's open and the command itself are each bounded by the
    /// operation timeout.
    async fn run<T, F, Fut>(&self, op: &'static str, command: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let handle = self.connections.acquire().await?;
        let conn = tokio::time::timeout(self.op_timeout, handle.connection())
            .await
            .map_err(|_| Error::Timeout {
                op,
                after: self.op_timeout,
            })??;

        match tokio::time::timeout(self.op_timeout, command(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if is_transport_error(&e) => {
                handle.report_error(format!("{op}: {e}"));
                Err(Error::Connection(format!("{op}: {e}")))
            }
            Ok(Err(e)) => Err(Error::Store(format!("{op}: {e}"))),
            Err(_) => {
                handle.report_error(format!("{op} timed out after {:?}", self.op_timeout));
                Err(Error::Timeout {
                    op,
                    after: self.op_timeout,
                })
            }
        }
    }
}

fn is_transport_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Whole seconds, at least one; `EXPIRE 0` would delete the key and so
/// would a negative value.
fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.run("GET", move |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.run("SET", move |mut conn| async move {
            conn.set_ex(key, value, ttl_secs(ttl) as u64).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.run("DEL", move |mut conn| async move {
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.run("EXPIRE", move |mut conn| async move {
            conn.expire(key, ttl_secs(ttl)).await
        })
        .await
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        self.run("TTL", move |mut conn| async move {
            // -2: no such key, -1: no expiry.
            let secs: i64 = conn.ttl(key).await?;
            Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<HashFields>> {
        self.run("HGETALL", move |mut conn| async move {
            let fields: HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
            Ok((!fields.is_empty()).then_some(fields))
        })
        .await
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<()> {
        self.run("HSET+EXPIRE", move |mut conn| async move {
            redis::pipe()
                .atomic()
                .hset_multiple(key, fields)
                .ignore()
                .expire(key, ttl_secs(ttl))
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hash_claim(
        &self,
        key: &str,
        guard: &str,
        token: &[u8],
        fields: &[(&str, &[u8])],
        ttl: Duration,
    ) -> Result<bool> {
        let mut invocation = self.hash_claim.prepare_invoke();
        invocation.key(key).arg(guard).arg(token).arg(ttl_secs(ttl));
        for (field, value) in fields {
            invocation.arg(*field).arg(*value);
        }
        self.run("HSETNX-CLAIM", move |mut conn| async move {
            let claimed: i64 = invocation.invoke_async(&mut conn).await?;
            Ok(claimed == 1)
        })
        .await
    }

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<usize> {
        self.run("HDEL", move |mut conn| async move { conn.hdel(key, fields).await })
            .await
    }

    async fn hash_delete_if_eq(
        &self,
        key: &str,
        guard: &str,
        expected: &[u8],
        fields: &[&str],
    ) -> Result<bool> {
        let script = &self.hash_delete_if_eq;
        self.run("HDEL-IF-EQ", move |mut conn| async move {
            let deleted: i64 = script
                .key(key)
                .arg(guard)
                .arg(expected)
                .arg(fields)
                .invoke_async(&mut conn)
                .await?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn delete_if_eq(&self, key: &str, guard: &str, expected: &[u8]) -> Result<bool> {
        let script = &self.delete_if_eq;
        self.run("DEL-IF-EQ", move |mut conn| async move {
            let deleted: i64 = script
                .key(key)
                .arg(guard)
                .arg(expected)
                .invoke_async(&mut conn)
                .await?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[async_trait]
impl CollectionStore for RedisStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.run("HGET", move |mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<()> {
        self.run("HSET", move |mut conn| async move {
            conn.hset_multiple(key, fields).await
        })
        .await
    }

    async fn set_add(&self, key: &str, members: &[&[u8]]) -> Result<usize> {
        self.run("SADD", move |mut conn| async move { conn.sadd(key, members).await })
            .await
    }

    async fn set_remove(&self, key: &str, members: &[&[u8]]) -> Result<usize> {
        self.run("SREM", move |mut conn| async move { conn.srem(key, members).await })
            .await
    }

    async fn set_contains(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.run("SISMEMBER", move |mut conn| async move {
            conn.sismember(key, member).await
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.run("SMEMBERS", move |mut conn| async move { conn.smembers(key).await })
            .await
    }

    async fn sorted_set_add(&self, key: &str, member: &[u8], score: f64) -> Result<bool> {
        self.run("ZADD", move |mut conn| async move {
            let added: i64 = conn.zadd(key, member, score).await?;
            Ok(added > 0)
        })
        .await
    }

    async fn sorted_set_remove(&self, key: &str, member: &[u8]) -> Result<bool> {
        self.run("ZREM", move |mut conn| async move {
            let removed: i64 = conn.zrem(key, member).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<Vec<u8>>> {
        self.run("ZRANGEBYSCORE", move |mut conn| async move {
            conn.zrangebyscore(key, min, max).await
        })
        .await
    }

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize> {
        self.run("RPUSH", move |mut conn| async move { conn.rpush(key, value).await })
            .await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        self.run("LRANGE", move |mut conn| async move {
            conn.lrange(key, start, stop).await
        })
        .await
    }
}
