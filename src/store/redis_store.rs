//! Redis-backed store.
//!
//! Each operation is one round trip: conditional steps run as Lua scripts,
//! the read-only log query runs as a MULTI/EXEC pipeline. Scores are
//! milliseconds since the epoch supplied by the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{
    duration_millis, expiry_seconds, BucketRequest, BucketState, LogEntry, LogSnapshot, Store,
    WindowCounter, WindowPair, WindowPairRequest,
};
use crate::error::{FloodgateError, Result};

const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
local window_seconds = tonumber(ARGV[1])

if count == 1 then
    redis.call("EXPIRE", KEYS[1], window_seconds)
end

local ttl = redis.call("PTTL", KEYS[1])
if ttl < 0 then
    redis.call("EXPIRE", KEYS[1], window_seconds)
    ttl = window_seconds * 1000
end

return {count, ttl}
"#;

const SLIDING_LOG_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local member = ARGV[2]
local window_ms = tonumber(ARGV[3])
local expire_seconds = tonumber(ARGV[4])
local limit = tonumber(ARGV[5])

redis.call("ZREMRANGEBYSCORE", key, "-inf", now - window_ms)
redis.call("ZADD", key, now, member)
local count = redis.call("ZCARD", key)
redis.call("EXPIRE", key, expire_seconds)

local rolled_back = 0
if limit >= 0 and count > limit then
    redis.call("ZREM", key, member)
    rolled_back = 1
end

local oldest_score = -1
local oldest = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")
if #oldest > 0 then
    oldest_score = tonumber(oldest[2])
end

return {count, oldest_score, rolled_back}
"#;

const WINDOW_PAIR_SCRIPT: &str = r#"
local key = KEYS[1]
local window_index = tonumber(ARGV[1])
local previous_weight = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local state = redis.call("HMGET", key, "window", "current", "previous")
local window = tonumber(state[1])
local current = tonumber(state[2]) or 0
local previous = tonumber(state[3]) or 0

if window == nil then
    window = window_index
    current = 0
    previous = 0
elseif window == window_index - 1 then
    previous = current
    current = 0
elseif window < window_index - 1 then
    previous = 0
    current = 0
end

if window < window_index then
    window = window_index
end

local allowed = 0
if previous * previous_weight + current + 1 <= limit then
    current = current + 1
    allowed = 1
end

redis.call("HSET", key, "window", window, "current", current, "previous", previous)
redis.call("PEXPIRE", key, ttl_ms)

return {current, previous, allowed}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl_seconds = tonumber(ARGV[4])

local state = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(state[1]) or capacity
local last_refill = tonumber(state[2]) or now

local elapsed = math.max(0, now - last_refill) / 1000
tokens = math.min(capacity, tokens + elapsed * refill_per_sec)

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

local encoded = string.format("%.6f", tokens)
redis.call("HSET", key, "tokens", encoded, "last_refill", math.max(now, last_refill))
redis.call("EXPIRE", key, ttl_seconds)

return {allowed, encoded}
"#;

struct Scripts {
    fixed_window: Script,
    sliding_log: Script,
    window_pair: Script,
    token_bucket: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_log: Script::new(SLIDING_LOG_SCRIPT),
            window_pair: Script::new(WINDOW_PAIR_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

/// A [`Store`] backed by a Redis server.
///
/// Cloning is cheap: clones share the same multiplexed connection, which
/// reconnects on its own after a dropped connection.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            scripts: Arc::new(Scripts::new()),
        }
    }

    /// Open a connection to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %sanitize_url(url), "Connecting to Redis");

        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;

        Ok(Self::new(connection_manager))
    }

    fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCounter> {
        let mut conn = self.connection();

        let (count, ttl_ms): (u64, i64) = self
            .scripts
            .fixed_window
            .key(key)
            .arg(expiry_seconds(window))
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCounter {
            count,
            ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
        })
    }

    async fn append_log(
        &self,
        key: &str,
        entry: &LogEntry,
        window: Duration,
        rollback_above: Option<u64>,
    ) -> Result<LogSnapshot> {
        let mut conn = self.connection();
        let limit = rollback_above.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));

        let (count, oldest_ms, rolled_back): (u64, i64, i64) = self
            .scripts
            .sliding_log
            .key(key)
            .arg(entry.score_ms)
            .arg(&entry.member)
            .arg(duration_millis(window))
            .arg(expiry_seconds(window) + 1)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(LogSnapshot {
            count,
            oldest_ms: (oldest_ms >= 0).then_some(oldest_ms),
            rolled_back: rolled_back == 1,
        })
    }

    async fn peek_log(&self, key: &str, window: Duration, now_ms: i64) -> Result<LogSnapshot> {
        let mut conn = self.connection();

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now_ms - duration_millis(window))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(LogSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as i64),
            rolled_back: false,
        })
    }

    async fn weighted_window(&self, key: &str, request: &WindowPairRequest) -> Result<WindowPair> {
        let mut conn = self.connection();

        let (current, previous, allowed): (u64, u64, i64) = self
            .scripts
            .window_pair
            .key(key)
            .arg(request.window_index)
            .arg(request.previous_weight)
            .arg(request.limit)
            .arg(duration_millis(request.ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowPair {
            current,
            previous,
            allowed: allowed == 1,
        })
    }

    async fn take_token(&self, key: &str, request: &BucketRequest) -> Result<BucketState> {
        let mut conn = self.connection();

        let (allowed, tokens): (i64, String) = self
            .scripts
            .token_bucket
            .key(key)
            .arg(request.capacity)
            .arg(request.refill_per_sec)
            .arg(request.now_ms)
            .arg(expiry_seconds(request.ttl))
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|e| {
            FloodgateError::StoreUnavailable(format!("unreadable token count {tokens:?}: {e}"))
        })?;

        Ok(BucketState {
            tokens,
            allowed: allowed == 1,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();
        let removed: u64 = conn.del(key).await?;
        debug!(key = %key, removed, "Deleted rate limit state");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Hide the password of a Redis URL for logging.
fn sanitize_url(url: &str) -> String {
    match url.rsplit_once('@') {
        Some((credentials, host)) => match credentials.split_once("://") {
            Some((scheme, _)) => format!("{scheme}://***@{host}"),
            None => format!("***@{host}"),
        },
        None => url.to_string(),
    }
}
