//! Window store: the two sets that make up the current counting window.
//!
//! The Identifier Set holds every distinct id seen since the last flush and
//! the Endpoint Set holds the callback URLs registered alongside them. Both
//! are owned by the backing store; the ingest path only adds, the aggregator
//! only reads and clears.
//!
//! Two implementations are provided:
//! - [`RedisStore`] - shared Redis sets, used in production so several
//!   ingest processes accumulate into one window
//! - [`MemoryStore`] - process-local sets for single-node runs and tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::redis::{self, cmd};
use bb8_redis::{RedisConnectionManager, bb8};
use parking_lot::Mutex;

use crate::{Error, Result};

/// Redis key for the Identifier Set.
pub const IDS_KEY: &str = "unique_ids_for_current_minute";

/// Redis key for the Endpoint Set.
pub const ENDPOINTS_KEY: &str = "endpoints_for_current_minute";

/// Everything read out of a window at flush time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Distinct identifier count.
    pub count: u64,
    /// Registered callback endpoints, in no particular order.
    pub endpoints: Vec<String>,
}

/// Operations over the current window's sets.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Add an id to the Identifier Set. Idempotent.
    async fn add_identifier(&self, id: i64) -> Result<()>;

    /// Add a callback URL to the Endpoint Set. Idempotent.
    async fn add_endpoint(&self, url: &str) -> Result<()>;

    /// Cardinality of the Identifier Set, 0 when absent.
    async fn count_identifiers(&self) -> Result<u64>;

    /// All stored endpoint URLs.
    async fn list_endpoints(&self) -> Result<Vec<String>>;

    /// Delete both sets.
    async fn clear_window(&self) -> Result<()>;

    /// Read the count and endpoints and delete both sets as one atomic step.
    ///
    /// Unlike `count_identifiers` + `list_endpoints` + `clear_window`, no
    /// concurrent insert can land between the read and the delete.
    async fn take_window(&self) -> Result<WindowSnapshot>;
}

// =============================================================================
// Redis
// =============================================================================

/// Window store backed by two Redis sets.
#[derive(Debug, Clone)]
pub struct RedisStore {
    pool: bb8::Pool<RedisConnectionManager>,
}

impl RedisStore {
    /// Build a connection pool for `redis_url`.
    ///
    /// Connections are opened lazily, so an unreachable server surfaces as
    /// [`Error::StoreUnavailable`] on first use rather than here.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = bb8::Pool::builder()
            .max_size(32)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .await?;

        tracing::info!(url = %redis_url, "redis window store ready");
        Ok(Self { pool })
    }

    /// Redis URL for a host/port pair on database 0.
    pub fn url(host: &str, port: u16) -> String {
        format!("redis://{host}:{port}/0")
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn add_identifier(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("SADD")
            .arg(IDS_KEY)
            .arg(id)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn add_endpoint(&self, url: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("SADD")
            .arg(ENDPOINTS_KEY)
            .arg(url)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn count_identifiers(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let count: u64 = cmd("SCARD").arg(IDS_KEY).query_async(&mut *conn).await?;
        Ok(count)
    }

    async fn list_endpoints(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let raw: Vec<Vec<u8>> = cmd("SMEMBERS")
            .arg(ENDPOINTS_KEY)
            .query_async(&mut *conn)
            .await?;
        Ok(decode_members(raw))
    }

    async fn clear_window(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("DEL")
            .arg(IDS_KEY)
            .arg(ENDPOINTS_KEY)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn take_window(&self) -> Result<WindowSnapshot> {
        let mut conn = self.pool.get().await?;
        let (count, raw): (u64, Vec<Vec<u8>>) = redis::pipe()
            .atomic()
            .cmd("SCARD")
            .arg(IDS_KEY)
            .cmd("SMEMBERS")
            .arg(ENDPOINTS_KEY)
            .cmd("DEL")
            .arg(IDS_KEY)
            .arg(ENDPOINTS_KEY)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        Ok(WindowSnapshot {
            count,
            endpoints: decode_members(raw),
        })
    }
}

/// Decode raw set members to text, replacing invalid UTF-8.
fn decode_members(raw: Vec<Vec<u8>>) -> Vec<String> {
    raw.into_iter()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect()
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct Window {
    ids: HashSet<i64>,
    endpoints: HashSet<String>,
}

/// Process-local window store.
///
/// Test builds (or the `test-util` feature) can switch it into an unavailable
/// state, in which every operation fails with [`Error::StoreUnavailable`] the
/// way an unreachable Redis would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    window: Mutex<Window>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: simulate the backing store going away (or coming back).
    #[cfg(any(test, feature = "test-util"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn add_identifier(&self, id: i64) -> Result<()> {
        self.check()?;
        self.window.lock().ids.insert(id);
        Ok(())
    }

    async fn add_endpoint(&self, url: &str) -> Result<()> {
        self.check()?;
        self.window.lock().endpoints.insert(url.to_string());
        Ok(())
    }

    async fn count_identifiers(&self) -> Result<u64> {
        self.check()?;
        Ok(self.window.lock().ids.len() as u64)
    }

    async fn list_endpoints(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.window.lock().endpoints.iter().cloned().collect())
    }

    async fn clear_window(&self) -> Result<()> {
        self.check()?;
        let mut window = self.window.lock();
        window.ids.clear();
        window.endpoints.clear();
        Ok(())
    }

    async fn take_window(&self) -> Result<WindowSnapshot> {
        self.check()?;
        let window = std::mem::take(&mut *self.window.lock());
        Ok(WindowSnapshot {
            count: window.ids.len() as u64,
            endpoints: window.endpoints.into_iter().collect(),
        })
    }
}
