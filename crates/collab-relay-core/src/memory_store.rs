//! Process-local [`SharedStore`] with Redis-like semantics.
//!
//! Clones share one keyspace and one pub/sub bus, so several coordinators
//! built on clones of the same store behave like separate processes talking
//! to one Redis. Expiry runs on the tokio clock, which lets tests pause and
//! advance time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::{BucketDecision, BucketPolicy, BucketState};
use crate::error::{RelayError, Result};
use crate::store::{BucketKeys, SharedStore, StoreMessage, Subscription, SubscriptionHandle};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
    Bucket(BucketState),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<StoreMessage>,
}

struct Inner {
    data: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    available: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory shared store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        check_available(&self.inner)
    }

    /// Run `f` on the live (non-expired) entry for `key`, if any.
    fn with_entry<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut data = lock(&self.inner.data);
        let now = Instant::now();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    fn with_set<R>(&self, key: &str, f: impl FnOnce(&HashSet<String>) -> R) -> Result<R> {
        let empty = HashSet::new();
        self.with_entry(key, |entry| match entry {
            None => Ok(f(&empty)),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(f(set)),
            Some(_) => Err(wrong_type(key)),
        })
    }
}

fn check_available(inner: &Inner) -> Result<()> {
    if inner.available.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(RelayError::StoreUnavailable("memory store is offline".into()))
    }
}

fn wrong_type(key: &str) -> RelayError {
    RelayError::Store(format!("WRONGTYPE operation against key '{key}'"))
}

/// Match `key` against a glob where `*` matches any run of characters.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }
    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        lock(&self.inner.data).insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.with_entry(key, |entry| entry.is_some()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        lock(&self.inner.data).remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.with_entry(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        let mut data = lock(&self.inner.data);
        let now = Instant::now();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        let mut data = lock(&self.inner.data);
        let emptied = match data.get_mut(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        // Redis drops a set once its last member is removed.
        if emptied {
            data.remove(key);
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        self.with_set(key, |set| set.contains(member))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        self.with_set(key, |set| {
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.sort();
            members
        })
    }

    async fn set_cardinality(&self, key: &str) -> Result<u64> {
        self.check()?;
        self.with_set(key, |set| set.len() as u64)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.check()?;
        let mut data = lock(&self.inner.data);
        let now = Instant::now();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Text("0".into()),
            expires_at: Some(now + ttl),
        });
        match &mut entry.value {
            Value::Text(v) => {
                let next = v
                    .parse::<i64>()
                    .map_err(|_| RelayError::Store(format!("value at '{key}' is not an integer")))?
                    + 1;
                *v = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn take_token(
        &self,
        keys: BucketKeys<'_>,
        policy: &BucketPolicy,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<BucketDecision> {
        self.check()?;
        // One lock section covers the penalty read, the bucket update and the
        // penalty write, the same guarantee a Lua script gets from Redis.
        let mut data = lock(&self.inner.data);
        let now = Instant::now();
        for key in [keys.bucket, keys.penalty] {
            if data.get(key).is_some_and(|e| e.is_expired(now)) {
                data.remove(key);
            }
        }

        let penalty_until = match data.get(keys.penalty) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => v.parse::<i64>().ok(),
            _ => None,
        };

        let mut state = match data.get(keys.bucket) {
            Some(Entry {
                value: Value::Bucket(state),
                ..
            }) => *state,
            Some(_) => return Err(wrong_type(keys.bucket)),
            None => BucketState::full(policy, now_ms),
        };
        state.clamp(policy);

        if let Some(until) = penalty_until.filter(|until| *until > now_ms) {
            return Ok(BucketDecision {
                allowed: false,
                tokens: state.tokens,
                penalty_until: Some(until),
                penalized_now: false,
            });
        }

        let decision = state.take(policy, now_ms);
        data.insert(
            keys.bucket.to_string(),
            Entry {
                value: Value::Bucket(state),
                expires_at: Some(now + idle_ttl),
            },
        );
        if let Some(until) = decision.penalty_until {
            let ttl = Duration::from_millis(policy.penalty_ms.max(1) as u64);
            data.insert(
                keys.penalty.to_string(),
                Entry {
                    value: Value::Text(until.to_string()),
                    expires_at: Some(now + ttl),
                },
            );
        }
        Ok(decision)
    }

    async fn bucket_state(&self, key: &str) -> Result<Option<BucketState>> {
        self.check()?;
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Bucket(state),
                ..
            }) => Ok(Some(*state)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut data = lock(&self.inner.data);
        let now = Instant::now();
        data.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.check()?;
        let mut subscribers = lock(&self.inner.subscribers);
        let mut delivered = 0;
        subscribers.retain(|_, sub| {
            if !sub.channels.contains(channel) {
                return !sub.tx.is_closed();
            }
            let msg = StoreMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            match sub.tx.send(msg) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        debug!(channel, delivered, "Memory store publish");
        Ok(delivered)
    }

    async fn open_subscription(&self) -> Result<Subscription> {
        self.check()?;
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).insert(
            id,
            Subscriber {
                channels: HashSet::new(),
                tx,
            },
        );
        Ok(Subscription {
            handle: Box::new(MemorySubscription {
                id,
                inner: self.inner.clone(),
            }),
            messages: rx,
        })
    }
}

struct MemorySubscription {
    id: u64,
    inner: Arc<Inner>,
}

impl MemorySubscription {
    fn update(&self, f: impl FnOnce(&mut HashSet<String>)) -> Result<()> {
        check_available(&self.inner)?;
        match lock(&self.inner.subscribers).get_mut(&self.id) {
            Some(sub) => {
                f(&mut sub.channels);
                Ok(())
            }
            None => Err(RelayError::Store("subscription is closed".into())),
        }
    }
}

#[async_trait]
impl SubscriptionHandle for MemorySubscription {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.update(|channels| {
            channels.insert(channel.to_string());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.update(|channels| {
            channels.remove(channel);
        })
    }

    async fn close(&self) -> Result<()> {
        lock(&self.inner.subscribers).remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:*", "a:b:c"));
        assert!(glob_match("a:*:c", "a:b:c"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a:*:d", "a:b:c"));
        assert!(!glob_match("a:*", "b:a"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".into()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_refreshes_set_ttl() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        store.expire("s", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store.expire("s", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.set_cardinality("s").await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.set_cardinality("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "a").await.unwrap();
        store.set_add("s", "b").await.unwrap();
        assert_eq!(store.set_cardinality("s").await.unwrap(), 2);
        assert!(store.set_contains("s", "a").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);

        store.set_remove("s", "a").await.unwrap();
        store.set_remove("s", "b").await.unwrap();
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_error() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(store.set_add("k", "x").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_with_ttl_sets_ttl_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 2);
        // TTL was not pushed back by the second increment.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_take_token_respects_penalty() {
        let store = MemoryStore::new();
        let policy = BucketPolicy::from_config(&RateLimitConfig::default());
        let keys = BucketKeys {
            bucket: "b",
            penalty: "p",
        };
        store
            .set_with_ttl("p", "10000", Duration::from_secs(10))
            .await
            .unwrap();
        let d = store
            .take_token(keys, &policy, 5000, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!d.allowed);
        assert_eq!(d.penalty_until, Some(10000));
        // Penalty denials leave the bucket untouched.
        assert!(store.bucket_state("b").await.unwrap().is_none());

        let d = store
            .take_token(keys, &policy, 10001, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_scan_keys() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.incr_with_ttl("rl:usage:a:m:1", ttl).await.unwrap();
        store.incr_with_ttl("rl:usage_total:m:1", ttl).await.unwrap();
        store.set_add("rl:conn:user:a", "c1").await.unwrap();
        let keys = store.scan_keys("rl:usage*").await.unwrap();
        assert_eq!(keys, vec!["rl:usage:a:m:1", "rl:usage_total:m:1"]);
    }

    #[tokio::test]
    async fn test_pubsub_routes_by_channel() {
        let store = MemoryStore::new();
        let mut a = store.open_subscription().await.unwrap();
        let mut b = store.open_subscription().await.unwrap();
        a.handle.subscribe("x").await.unwrap();
        b.handle.subscribe("y").await.unwrap();

        assert_eq!(store.publish("x", "hello").await.unwrap(), 1);
        let msg = a.messages.recv().await.unwrap();
        assert_eq!(msg.channel, "x");
        assert_eq!(msg.payload, "hello");
        assert!(b.messages.try_recv().is_err());

        a.handle.unsubscribe("x").await.unwrap();
        assert_eq!(store.publish("x", "again").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_message_stream() {
        let store = MemoryStore::new();
        let mut sub = store.open_subscription().await.unwrap();
        sub.handle.subscribe("x").await.unwrap();
        sub.handle.close().await.unwrap();
        assert!(sub.messages.recv().await.is_none());
        assert!(sub.handle.subscribe("x").await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(RelayError::StoreUnavailable(_))
        ));
        assert!(store.publish("c", "p").await.is_err());
        assert!(store.open_subscription().await.is_err());
        store.set_available(true);
        assert!(store.get("k").await.is_ok());
    }
}
