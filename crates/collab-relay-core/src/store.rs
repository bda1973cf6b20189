//! Shared backing store interface.
//!
//! Everything the coordinator and the rate limiter need from the store that
//! all gateway processes share: keyed values with TTL, sets, atomic counters,
//! an atomic token-bucket step, and publish/subscribe.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bucket::{BucketDecision, BucketPolicy, BucketState};
use crate::error::Result;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Control side of a dedicated subscription connection.
#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Tear the connection down. The message receiver yields `None` afterwards.
    async fn close(&self) -> Result<()>;
}

/// A dedicated subscription connection: control handle plus inbound messages.
pub struct Subscription {
    pub handle: Box<dyn SubscriptionHandle>,
    pub messages: mpsc::UnboundedReceiver<StoreMessage>,
}

/// Keys touched by one atomic token-bucket step.
#[derive(Debug, Clone, Copy)]
pub struct BucketKeys<'a> {
    pub bucket: &'a str,
    pub penalty: &'a str,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_cardinality(&self, key: &str) -> Result<u64>;

    /// Atomically increment a counter, setting `ttl` when the key is created.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// One atomic token-bucket step: deny if the penalty key holds a time
    /// after `now_ms`, otherwise [`BucketState::take`] and persist the result,
    /// writing the penalty key when the take overflows the floor.
    async fn take_token(
        &self,
        keys: BucketKeys<'_>,
        policy: &BucketPolicy,
        now_ms: i64,
        idle_ttl: Duration,
    ) -> Result<BucketDecision>;

    /// Read bucket state without refilling or consuming.
    async fn bucket_state(&self, key: &str) -> Result<Option<BucketState>>;

    /// Keys matching a glob pattern (`*` wildcard only).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Publish a payload; returns the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Open a dedicated subscription connection.
    async fn open_subscription(&self) -> Result<Subscription>;
}
