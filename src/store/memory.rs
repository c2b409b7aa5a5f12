//! In-process store implementing the same atomic contract as Redis.
//!
//! Every operation runs under one mutex, which gives the same per-call
//! atomicity Redis gives a script or MULTI block. The lock is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{
    duration_millis, expiry_seconds, BucketRequest, BucketState, LogEntry, LogSnapshot, Store,
    WindowCounter, WindowPair, WindowPairRequest,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    /// Sorted by (score, member)
    Log(Vec<(i64, String)>),
    Pair {
        window: i64,
        current: u64,
        previous: u64,
    },
    Bucket {
        tokens: f64,
        last_refill_ms: i64,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// A [`Store`] kept in process memory.
///
/// Expiry follows the injected [`Clock`], so tests can move time forward
/// without sleeping. The store can also be switched off or slowed down to
/// exercise the failure paths of the callers.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    latency: Duration,
}

impl MemoryStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
            latency: Duration::ZERO,
        }
    }

    /// Delay every operation by `latency` before it touches the data.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members of the sliding log at `key`, oldest first.
    pub fn log_members(&self, key: &str) -> Vec<String> {
        let now = self.clock.now_millis();
        match self.entries.lock().get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Log(items) => items.iter().map(|(_, member)| member.clone()).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Remaining time to live of `key`, if it exists and expires.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|entry| !entry.is_expired(now))?;
        let at = entry.expires_at_ms?;
        Some(Duration::from_millis(u64::try_from(at - now).unwrap_or(0)))
    }

    async fn enter(&self) -> Result<i64> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(FloodgateError::StoreUnavailable(
                "memory store is switched off".to_string(),
            ));
        }
        Ok(self.clock.now_millis())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop `key` if it has expired.
fn purge(entries: &mut HashMap<String, Entry>, key: &str, now: i64) {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
}

/// Drop `key` if it has expired and return the live entry, if any.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: i64) -> Option<&'a mut Entry> {
    purge(entries, key, now);
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> FloodgateError {
    FloodgateError::StoreUnavailable(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

fn prune(items: &mut Vec<(i64, String)>, window_start: i64) {
    items.retain(|(score, _)| *score > window_start);
}

fn snapshot(items: &[(i64, String)]) -> LogSnapshot {
    LogSnapshot {
        count: items.len() as u64,
        oldest_ms: items.first().map(|(score, _)| *score),
        rolled_back: false,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCounter> {
        let now = self.enter().await?;
        let window_ms = expiry_seconds(window) as i64 * 1000;

        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Counter(0),
            expires_at_ms: None,
        });

        let count = match &mut entry.value {
            Value::Counter(count) => {
                *count += 1;
                *count
            }
            _ => return Err(wrong_type(key)),
        };

        if count == 1 || entry.expires_at_ms.is_none() {
            entry.expires_at_ms = Some(now + window_ms);
        }

        let ttl_ms = entry.expires_at_ms.map_or(window_ms, |at| at - now);
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
        let now = self.enter().await?;
        let window_start = entry.score_ms - duration_millis(window);
        let expires_at = now + (expiry_seconds(window) as i64 + 1) * 1000;

        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);
        let stored = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Log(Vec::new()),
            expires_at_ms: None,
        });

        let Value::Log(items) = &mut stored.value else {
            return Err(wrong_type(key));
        };

        prune(items, window_start);
        let position = items
            .binary_search_by(|(score, member)| {
                (*score, member.as_str()).cmp(&(entry.score_ms, entry.member.as_str()))
            })
            .unwrap_or_else(|position| position);
        items.insert(position, (entry.score_ms, entry.member.clone()));

        let count = items.len() as u64;
        let rolled_back = rollback_above.is_some_and(|limit| count > limit);
        if rolled_back {
            items.retain(|(_, member)| member != &entry.member);
        }

        let oldest_ms = items.first().map(|(score, _)| *score);
        stored.expires_at_ms = Some(expires_at);

        trace!(key = %key, count, rolled_back, "memory store appended log entry");

        Ok(LogSnapshot {
            count,
            oldest_ms,
            rolled_back,
        })
    }

    async fn peek_log(&self, key: &str, window: Duration, now_ms: i64) -> Result<LogSnapshot> {
        let now = self.enter().await?;
        let window_start = now_ms - duration_millis(window);

        let mut entries = self.entries.lock();
        match live(&mut entries, key, now) {
            None => Ok(LogSnapshot::default()),
            Some(stored) => match &mut stored.value {
                Value::Log(items) => {
                    prune(items, window_start);
                    Ok(snapshot(items))
                }
                _ => Err(wrong_type(key)),
            },
        }
    }

    async fn weighted_window(&self, key: &str, request: &WindowPairRequest) -> Result<WindowPair> {
        let now = self.enter().await?;

        let mut entries = self.entries.lock();
        let (mut window, mut current, mut previous) = match live(&mut entries, key, now) {
            None => (request.window_index, 0, 0),
            Some(stored) => match stored.value {
                Value::Pair {
                    window,
                    current,
                    previous,
                } => (window, current, previous),
                _ => return Err(wrong_type(key)),
            },
        };

        if window == request.window_index - 1 {
            previous = current;
            current = 0;
        } else if window < request.window_index - 1 {
            previous = 0;
            current = 0;
        }
        window = window.max(request.window_index);

        let estimate = previous as f64 * request.previous_weight + current as f64;
        let allowed = estimate + 1.0 <= request.limit as f64;
        if allowed {
            current += 1;
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Pair {
                    window,
                    current,
                    previous,
                },
                expires_at_ms: Some(now + duration_millis(request.ttl)),
            },
        );

        Ok(WindowPair {
            current,
            previous,
            allowed,
        })
    }

    async fn take_token(&self, key: &str, request: &BucketRequest) -> Result<BucketState> {
        let now = self.enter().await?;
        let capacity = request.capacity as f64;

        let mut entries = self.entries.lock();
        let (tokens, last_refill_ms) = match live(&mut entries, key, now) {
            None => (capacity, request.now_ms),
            Some(stored) => match stored.value {
                Value::Bucket {
                    tokens,
                    last_refill_ms,
                } => (tokens, last_refill_ms),
                _ => return Err(wrong_type(key)),
            },
        };

        let elapsed_secs = (request.now_ms - last_refill_ms).max(0) as f64 / 1000.0;
        let mut tokens = capacity.min(tokens + elapsed_secs * request.refill_per_sec);
        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bucket {
                    tokens,
                    last_refill_ms: last_refill_ms.max(request.now_ms),
                },
                expires_at_ms: Some(now + duration_millis(request.ttl)),
            },
        );

        Ok(BucketState { tokens, allowed })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter().await?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_incr_window_arms_expiry_on_first_hit() {
        let (clock, store) = store();
        let window = Duration::from_millis(1_500);

        let first = store.incr_window("k", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, Duration::from_secs(2));

        clock.advance(Duration::from_millis(500));
        let second = store.incr_window("k", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl, Duration::from_millis(1_500));

        clock.advance(Duration::from_millis(1_500));
        let fresh = store.incr_window("k", window).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_append_log_prunes_and_rolls_back() {
        let (clock, store) = store();
        let window = Duration::from_secs(10);

        for _ in 0..2 {
            let entry = LogEntry::new(clock.now_millis());
            store.append_log("log", &entry, window, Some(2)).await.unwrap();
        }

        let denied = LogEntry::new(clock.now_millis());
        let snapshot = store.append_log("log", &denied, window, Some(2)).await.unwrap();
        assert_eq!(snapshot.count, 3);
        assert!(snapshot.rolled_back);
        assert!(!store.log_members("log").contains(&denied.member));

        clock.advance(Duration::from_secs(10));
        let peek = store
            .peek_log("log", window, clock.now_millis())
            .await
            .unwrap();
        assert_eq!(peek.count, 0);
        assert_eq!(peek.oldest_ms, None);
    }

    #[tokio::test]
    async fn test_weighted_window_rolls_pair_forward() {
        let (_clock, store) = store();
        let mut request = WindowPairRequest {
            window_index: 10,
            previous_weight: 1.0,
            limit: 3,
            ttl: Duration::from_secs(2),
        };

        for _ in 0..3 {
            assert!(store.weighted_window("p", &request).await.unwrap().allowed);
        }
        assert!(!store.weighted_window("p", &request).await.unwrap().allowed);

        request.window_index = 11;
        request.previous_weight = 0.5;
        let pair = store.weighted_window("p", &request).await.unwrap();
        assert_eq!(pair.previous, 3);
        assert_eq!(pair.current, 1);
        assert!(pair.allowed);

        request.window_index = 13;
        let pair = store.weighted_window("p", &request).await.unwrap();
        assert_eq!(pair.previous, 0);
        assert_eq!(pair.current, 1);
    }

    #[tokio::test]
    async fn test_take_token_refills_up_to_capacity() {
        let (clock, store) = store();
        let mut request = BucketRequest {
            capacity: 2,
            refill_per_sec: 1.0,
            now_ms: clock.now_millis(),
            ttl: Duration::from_secs(20),
        };

        assert!(store.take_token("b", &request).await.unwrap().allowed);
        assert!(store.take_token("b", &request).await.unwrap().allowed);
        let empty = store.take_token("b", &request).await.unwrap();
        assert!(!empty.allowed);
        assert_eq!(empty.tokens, 0.0);

        request.now_ms += 60_000;
        let refilled = store.take_token("b", &request).await.unwrap();
        assert!(refilled.allowed);
        assert_eq!(refilled.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let (_clock, store) = store();
        store.incr_window("k", Duration::from_secs(1)).await.unwrap();

        let entry = LogEntry::new(0);
        let result = store.append_log("k", &entry, Duration::from_secs(1), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let (_clock, store) = store();
        store.set_available(false);

        let err = store.ping().await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(store.delete("k").await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_clock, store) = store();
        store.incr_window("k", Duration::from_secs(1)).await.unwrap();

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
    }
}
