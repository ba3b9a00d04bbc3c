//! Shared lock & queue backend
//!
//! The control plane needs four primitives from an external key/value
//! store: atomic claim with TTL (`SET NX EX`), compare-and-delete
//! release, bounded list ops and plain get/del/exists. [`RedisBackend`]
//! is the production implementation; [`MemoryBackend`] backs tests and
//! single-process deployments.
//!
//! No durable state lives here: wiping the backend degrades the platform
//! to "all agents idle" without touching the state store.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from the lock/queue backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Key/value primitives the queue and locks are built on
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// `SET key value EX ttl NX` - returns whether the claim succeeded
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool>;

    /// `SET key value EX ttl` - unconditional write
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// `DEL key` - returns whether a key existed
    async fn del(&self, key: &str) -> BackendResult<bool>;

    /// Delete only if the current value matches (atomic CAS release)
    async fn del_if_equals(&self, key: &str, value: &str) -> BackendResult<bool>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> BackendResult<bool>;

    /// Remaining TTL, `None` when the key is absent or has no expiry
    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>>;

    /// `LPUSH key value` - returns the new list length
    async fn lpush(&self, key: &str, value: &str) -> BackendResult<usize>;

    /// `RPOP key`
    async fn rpop(&self, key: &str) -> BackendResult<Option<String>>;

    /// `LRANGE key 0 -1`
    async fn lrange_all(&self, key: &str) -> BackendResult<Vec<String>>;

    /// `LLEN key`
    async fn llen(&self, key: &str) -> BackendResult<usize>;

    /// `KEYS pattern` - pattern uses `*` as the only wildcard
    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>>;
}

// Lua release script: delete only when the held value matches, so one
// worker cannot release another worker's lock.
const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Redis-backed implementation
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to the given `redis://` URL
    pub async fn connect(url: &str) -> BackendResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BackendError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let t: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok((t > 0).then(|| Duration::from_secs(t as u64)))
    }

    async fn lpush(&self, key: &str, value: &str) -> BackendResult<usize> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(n as usize)
    }

    async fn rpop(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("RPOP").arg(key).query_async(&mut conn).await?)
    }

    async fn lrange_all(&self, key: &str) -> BackendResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?)
    }

    async fn llen(&self, key: &str) -> BackendResult<usize> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(n as usize)
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-process implementation with real TTL semantics
///
/// Used by tests and by single-process deployments that skip Redis.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(state: &mut MemoryState) {
        state.strings.retain(|_, entry| !entry.expired());
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        Ok(state.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<bool> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        let existed = state.strings.remove(key).is_some();
        let had_list = state.lists.remove(key).is_some();
        Ok(existed || had_list)
    }

    async fn del_if_equals(&self, key: &str, value: &str) -> BackendResult<bool> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        match state.strings.get(key) {
            Some(entry) if entry.value == value => {
                state.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        Ok(state.strings.contains_key(key) || state.lists.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> BackendResult<Option<Duration>> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        Ok(state
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn lpush(&self, key: &str, value: &str) -> BackendResult<usize> {
        let mut state = self.state.lock();
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len())
    }

    async fn rpop(&self, key: &str) -> BackendResult<Option<String>> {
        let mut state = self.state.lock();
        let popped = state.lists.get_mut(key).and_then(|list| list.pop_back());
        if state.lists.get(key).is_some_and(|l| l.is_empty()) {
            state.lists.remove(key);
        }
        Ok(popped)
    }

    async fn lrange_all(&self, key: &str) -> BackendResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn llen(&self, key: &str) -> BackendResult<usize> {
        let state = self.state.lock();
        Ok(state.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let mut state = self.state.lock();
        Self::purge(&mut state);
        let matcher = |key: &str| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        };
        let mut matched: Vec<String> = state
            .strings
            .keys()
            .chain(state.lists.keys())
            .filter(|k| matcher(k))
            .cloned()
            .collect();
        matched.sort();
        matched.dedup();
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_claims_once() {
        let backend = MemoryBackend::new();
        assert!(backend.set_nx_ex("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!backend.set_nx_ex("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_ttl_expiry_releases_claim() {
        let backend = MemoryBackend::new();
        backend
            .set_nx_ex("k", "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.set_nx_ex("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_del_if_equals_is_cas() {
        let backend = MemoryBackend::new();
        backend.set_ex("k", "mine", Duration::from_secs(10)).await.unwrap();
        assert!(!backend.del_if_equals("k", "theirs").await.unwrap());
        assert!(backend.exists("k").await.unwrap());
        assert!(backend.del_if_equals("k", "mine").await.unwrap());
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_fifo_via_lpush_rpop() {
        let backend = MemoryBackend::new();
        backend.lpush("q", "first").await.unwrap();
        backend.lpush("q", "second").await.unwrap();
        backend.lpush("q", "third").await.unwrap();
        assert_eq!(backend.llen("q").await.unwrap(), 3);

        // rpop returns the oldest
        assert_eq!(backend.rpop("q").await.unwrap().as_deref(), Some("first"));
        assert_eq!(backend.rpop("q").await.unwrap().as_deref(), Some("second"));
        assert_eq!(backend.rpop("q").await.unwrap().as_deref(), Some("third"));
        assert_eq!(backend.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lrange_newest_first() {
        let backend = MemoryBackend::new();
        backend.lpush("q", "old").await.unwrap();
        backend.lpush("q", "new").await.unwrap();
        assert_eq!(backend.lrange_all("q").await.unwrap(), vec!["new", "old"]);
    }

    #[tokio::test]
    async fn test_keys_prefix_scan() {
        let backend = MemoryBackend::new();
        backend.set_ex("agent:running:alpha", "x", Duration::from_secs(5)).await.unwrap();
        backend.set_ex("agent:running:beta", "x", Duration::from_secs(5)).await.unwrap();
        backend.set_ex("other", "x", Duration::from_secs(5)).await.unwrap();
        let keys = backend.keys("agent:running:*").await.unwrap();
        assert_eq!(keys, vec!["agent:running:alpha", "agent:running:beta"]);
    }
}
