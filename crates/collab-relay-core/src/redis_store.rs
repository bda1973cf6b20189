//! Redis-backed [`SharedStore`].
//!
//! Commands go through a `ConnectionManager` (auto-reconnecting, cheap to
//! clone). Each subscription gets its own pub/sub connection, split into a
//! sink for (un)subscribe commands and a stream forwarded onto an mpsc
//! channel.

use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bucket::{BucketDecision, BucketPolicy, BucketState};
use crate::error::Result;
use crate::store::{BucketKeys, SharedStore, StoreMessage, Subscription, SubscriptionHandle};

/// INCR and set the TTL only on the first increment, in one round trip.
static INCR_WITH_TTL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
        end
        return count
        ",
    )
});

/// Server-side port of `BucketState::take` plus the penalty check.
///
/// KEYS: bucket hash, penalty key.
/// ARGV: now_ms, max_tokens, burst_allowance, window_ms, penalty_ms, idle_ttl_secs.
/// Returns {allowed, tokens, penalty_until_or_0, penalized_now}.
static TAKE_TOKEN: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local now = tonumber(ARGV[1])
        local max_tokens = tonumber(ARGV[2])
        local burst = tonumber(ARGV[3])
        local window_ms = tonumber(ARGV[4])
        local penalty_ms = tonumber(ARGV[5])
        local idle_ttl = tonumber(ARGV[6])
        local capacity = max_tokens + burst

        local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
        local tokens = tonumber(state[1])
        local last = tonumber(state[2])
        if tokens == nil or last == nil then
            tokens = capacity
            last = now
        end
        if tokens > capacity then
            tokens = capacity
        elseif tokens < -burst then
            tokens = -burst
        end

        local penalty_until = tonumber(redis.call('GET', KEYS[2]))
        if penalty_until ~= nil and penalty_until > now then
            return {0, tokens, penalty_until, 0}
        end

        local elapsed = now - last
        if elapsed > 0 then
            local added = math.floor(elapsed * max_tokens / window_ms)
            if added > 0 then
                tokens = math.min(tokens + added, capacity)
                if tokens >= capacity then
                    last = now
                else
                    last = last + math.floor(added * window_ms / max_tokens)
                end
            end
        end

        local allowed = 0
        local penalized = 0
        local until_ms = 0
        tokens = tokens - 1
        if tokens >= 0 then
            allowed = 1
        elseif tokens < -burst then
            tokens = -burst
            until_ms = now + penalty_ms
            penalized = 1
            redis.call('SET', KEYS[2], until_ms, 'PX', math.max(penalty_ms, 1))
        end

        redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
        redis.call('EXPIRE', KEYS[1], idle_ttl)
        return {allowed, tokens, until_ms, penalized}
        ",
    )
});

/// Shared store on top of a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis. Supports `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Connected to Redis store");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().srem(key, member).await?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let found: bool = self.conn().sismember(key, member).await?;
        Ok(found)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut members: Vec<String> = self.conn().smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn set_cardinality(&self, key: &str) -> Result<u64> {
        let count: u64 = self.conn().scard(key).await?;
        Ok(count)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn();
        let count: i64 = INCR_WITH_TTL
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn take_token(
        &self,
        keys: BucketKeys<'_>,
        policy: &BucketPolicy,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<BucketDecision> {
        let mut conn = self.conn();
        let (allowed, tokens, penalty_until, penalized): (i64, i64, i64, i64) = TAKE_TOKEN
            .key(keys.bucket)
            .key(keys.penalty)
            .arg(now_ms)
            .arg(policy.max_tokens)
            .arg(policy.burst_allowance)
            .arg(policy.window_ms)
            .arg(policy.penalty_ms)
            .arg(idle_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            tokens,
            penalty_until: (penalty_until > 0).then_some(penalty_until),
            penalized_now: penalized == 1,
        })
    }

    async fn bucket_state(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.conn();
        let (tokens, last): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await?;
        Ok(match (tokens, last) {
            (Some(tokens), Some(last_refill_ms)) => Some(BucketState {
                tokens,
                last_refill_ms,
            }),
            _ => None,
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        // SCAN instead of KEYS so large keyspaces do not block the server.
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let receivers: u64 = self.conn().publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn open_subscription(&self) -> Result<Subscription> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, mut stream) = pubsub.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let forwarder = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%e, channel = msg.get_channel_name(), "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                let message = StoreMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            debug!("Redis subscription stream ended");
        });

        Ok(Subscription {
            handle: Box::new(RedisSubscription {
                sink: tokio::sync::Mutex::new(sink),
                forwarder: Mutex::new(Some(forwarder)),
            }),
            messages: rx,
        })
    }
}

struct RedisSubscription {
    sink: tokio::sync::Mutex<PubSubSink>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SubscriptionHandle for RedisSubscription {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.sink.lock().await.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.sink.lock().await.unsubscribe(channel).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = forwarder {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        let forwarder = self
            .forwarder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = forwarder {
            task.abort();
        }
    }
}
