//! Distributed rate limiter: per-user token bucket, per-user and per-IP
//! connection quotas, usage counters and a penalty box, all held in the
//! shared store so every gateway process enforces the same limits.
//!
//! Checks fail open. When the store cannot answer, the message or connection
//! is admitted and a warning is logged.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use collab_relay_core::bucket::{BucketPolicy, BucketState};
use collab_relay_core::config::{MAX_PENALTY_DURATION_MS, RateLimitConfig, RateLimitConfigPatch};
use collab_relay_core::error::{RelayError, Result};
use collab_relay_core::protocol::{ConnectionScope, RateLimitKeys, UsageWindow};
use collab_relay_core::store::{BucketKeys, SharedStore};

use crate::metrics;

const MINUTE_USAGE_TTL: Duration = Duration::from_secs(2 * 3600);
const HOUR_USAGE_TTL: Duration = Duration::from_secs(48 * 3600);

/// Stats cannot look further back than the per-minute totals live.
pub const MAX_STATS_PERIOD_MINUTES: u32 = (MINUTE_USAGE_TTL.as_secs() / 60) as u32;

pub const REASON_RATE_LIMITED: &str = "rate_limit_exceeded";
pub const REASON_PENALIZED: &str = "penalized";
pub const REASON_PENALTY_APPLIED: &str = "penalty_applied";
pub const REASON_CONNECTION_LIMIT: &str = "connection_limit_exceeded";
pub const REASON_FAIL_OPEN: &str = "fail_open";

/// Source of "now" in epoch milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Outcome of a message throughput check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Epoch ms. Allowed: when the bucket is full again. Denied: when the
    /// next token accrues. Penalized: when the penalty ends.
    pub reset_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a connection quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch ms at which an abandoned connection entry would lapse.
    pub reset_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Read-only view of one user's limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub user_id: String,
    pub tokens: i64,
    pub capacity: i64,
    pub penalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_until: Option<i64>,
    pub connections: u64,
    pub max_connections: u32,
    pub messages_this_minute: i64,
    pub messages_this_hour: i64,
}

/// Cluster-wide aggregate for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    /// Effective period, after clamping to `1..=MAX_STATS_PERIOD_MINUTES`.
    pub period_minutes: u32,
    pub total_messages: i64,
    pub active_penalties: usize,
    pub connected_users: usize,
    pub connected_ips: usize,
    pub total_connections: u64,
    pub config: RateLimitConfig,
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    keys: RateLimitKeys,
    config: RwLock<RateLimitConfig>,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimitConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(store: Arc<dyn SharedStore>, config: RateLimitConfig, clock: Clock) -> Self {
        Self {
            store,
            keys: RateLimitKeys::new(config.key_prefix.clone()),
            config: RwLock::new(config),
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    pub fn keys(&self) -> &RateLimitKeys {
        &self.keys
    }

    pub async fn get_config(&self) -> RateLimitConfig {
        self.config.read().await.clone()
    }

    /// Apply a partial update. An update that would produce an invalid config
    /// is rejected and the current config stays in place.
    pub async fn update_config(&self, patch: &RateLimitConfigPatch) -> Result<RateLimitConfig> {
        let mut config = self.config.write().await;
        let next = config.merged(patch);
        next.validate()?;
        if next != *config {
            info!(?patch, "Rate limit config updated");
        }
        *config = next.clone();
        Ok(next)
    }

    /// Composite gate: throughput AND the user's connection quota AND, when
    /// an address is given, the IP's connection quota.
    ///
    /// A connection that is already registered passes the connection gates,
    /// so a user sitting exactly at the cap is not locked out of their own
    /// sessions. The connection gates run first: a connection they reject
    /// spends no token and cannot earn the user a penalty.
    pub async fn check_rate_limit(
        &self,
        user_id: &str,
        connection_id: Option<&str>,
        ip: Option<&str>,
    ) -> bool {
        match self.try_check_rate_limit(user_id, connection_id, ip).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(user_id, %e, "Rate limit check failed, allowing");
                metrics::record_rate_limit_decision(REASON_FAIL_OPEN);
                true
            }
        }
    }

    async fn try_check_rate_limit(
        &self,
        user_id: &str,
        connection_id: Option<&str>,
        ip: Option<&str>,
    ) -> Result<bool> {
        if !self
            .connection_gate(ConnectionScope::User, user_id, connection_id)
            .await?
        {
            return Ok(false);
        }
        if let Some(ip) = ip {
            if !self
                .connection_gate(ConnectionScope::Ip, ip, connection_id)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(self.try_check_message(user_id).await?.allowed)
    }

    async fn connection_gate(
        &self,
        scope: ConnectionScope,
        identifier: &str,
        connection_id: Option<&str>,
    ) -> Result<bool> {
        if let Some(connection_id) = connection_id {
            let key = self.keys.connections(scope, identifier);
            if self.store.set_contains(&key, connection_id).await? {
                return Ok(true);
            }
        }
        Ok(self.try_check_connection(identifier, scope).await?.allowed)
    }

    /// Token-bucket check for one message.
    pub async fn check_message_rate_limit(
        &self,
        user_id: &str,
        connection_id: Option<&str>,
    ) -> RateLimitResult {
        match self.try_check_message(user_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(user_id, ?connection_id, %e, "Message rate check failed, allowing");
                metrics::record_rate_limit_decision(REASON_FAIL_OPEN);
                RateLimitResult {
                    allowed: true,
                    remaining: 0,
                    reset_time: self.now_ms(),
                    penalty_until: None,
                    reason: Some(REASON_FAIL_OPEN.into()),
                }
            }
        }
    }

    async fn try_check_message(&self, user_id: &str) -> Result<RateLimitResult> {
        let policy = BucketPolicy::from_config(&*self.config.read().await);
        let now = self.now_ms();
        let bucket = self.keys.bucket(user_id);
        let penalty = self.keys.penalty(user_id);
        let decision = self
            .store
            .take_token(
                BucketKeys {
                    bucket: &bucket,
                    penalty: &penalty,
                },
                &policy,
                now,
                Duration::from_secs(policy.idle_ttl_secs()),
            )
            .await?;

        let remaining = u32::try_from(decision.tokens.max(0)).unwrap_or(u32::MAX);
        let result = match decision.penalty_until {
            Some(until) if decision.penalized_now => {
                warn!(user_id, penalty_until = until, "Burst exhausted, penalty applied");
                metrics::record_rate_limit_decision(REASON_PENALIZED);
                RateLimitResult {
                    allowed: false,
                    remaining,
                    reset_time: until,
                    penalty_until: Some(until),
                    reason: Some(REASON_PENALTY_APPLIED.into()),
                }
            }
            Some(until) => {
                debug!(user_id, penalty_until = until, "Denied while penalized");
                metrics::record_rate_limit_decision(REASON_PENALIZED);
                RateLimitResult {
                    allowed: false,
                    remaining,
                    reset_time: until,
                    penalty_until: Some(until),
                    reason: Some(REASON_PENALIZED.into()),
                }
            }
            None if decision.allowed => {
                metrics::record_rate_limit_decision("allowed");
                RateLimitResult {
                    allowed: true,
                    remaining,
                    reset_time: now + policy.millis_for(policy.capacity() - decision.tokens),
                    penalty_until: None,
                    reason: None,
                }
            }
            None => {
                debug!(user_id, tokens = decision.tokens, "Message rate limited");
                metrics::record_rate_limit_decision("denied");
                RateLimitResult {
                    allowed: false,
                    remaining,
                    reset_time: now + policy.millis_for(1),
                    penalty_until: None,
                    reason: Some(REASON_RATE_LIMITED.into()),
                }
            }
        };
        Ok(result)
    }

    /// Compare the live connection count for `identifier` against its cap.
    pub async fn check_connection_limit(
        &self,
        identifier: &str,
        scope: ConnectionScope,
    ) -> ConnectionLimitResult {
        match self.try_check_connection(identifier, scope).await {
            Ok(result) => result,
            Err(e) => {
                warn!(identifier, scope = scope.as_str(), %e, "Connection limit check failed, allowing");
                metrics::record_rate_limit_decision(REASON_FAIL_OPEN);
                ConnectionLimitResult {
                    allowed: true,
                    remaining: 0,
                    reset_time: self.now_ms(),
                    reason: Some(REASON_FAIL_OPEN.into()),
                }
            }
        }
    }

    async fn try_check_connection(
        &self,
        identifier: &str,
        scope: ConnectionScope,
    ) -> Result<ConnectionLimitResult> {
        let (max, ttl_secs) = {
            let config = self.config.read().await;
            let max = match scope {
                ConnectionScope::User => config.max_connections_per_user,
                ConnectionScope::Ip => config.max_connections_per_ip,
            };
            (max, config.connection_ttl_secs)
        };
        let count = self
            .store
            .set_cardinality(&self.keys.connections(scope, identifier))
            .await?;
        let allowed = count < max as u64;
        if !allowed {
            debug!(identifier, scope = scope.as_str(), count, max, "Connection limit reached");
        }
        Ok(ConnectionLimitResult {
            allowed,
            remaining: (max as u64).saturating_sub(count) as u32,
            reset_time: self.now_ms() + ttl_secs as i64 * 1000,
            reason: (!allowed).then(|| REASON_CONNECTION_LIMIT.to_string()),
        })
    }

    /// Add a connection to the user's (and IP's) connection set, refreshing
    /// the set's TTL.
    pub async fn register_connection(
        &self,
        user_id: &str,
        connection_id: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        let ttl = Duration::from_secs(self.config.read().await.connection_ttl_secs);
        let mut keys = vec![self.keys.connections(ConnectionScope::User, user_id)];
        if let Some(ip) = ip {
            keys.push(self.keys.connections(ConnectionScope::Ip, ip));
        }
        for key in &keys {
            self.store.set_add(key, connection_id).await?;
            self.store.expire(key, ttl).await?;
        }
        debug!(user_id, connection_id, ?ip, "Connection registered");
        Ok(())
    }

    /// Remove a connection. Failures are logged; the entry lapses with its TTL.
    pub async fn unregister_connection(&self, user_id: &str, connection_id: &str, ip: Option<&str>) {
        let mut keys = vec![self.keys.connections(ConnectionScope::User, user_id)];
        if let Some(ip) = ip {
            keys.push(self.keys.connections(ConnectionScope::Ip, ip));
        }
        for key in &keys {
            if let Err(e) = self.store.set_remove(key, connection_id).await {
                warn!(key = %key, connection_id, %e, "Failed to unregister connection");
            }
        }
        debug!(user_id, connection_id, "Connection unregistered");
    }

    /// Bump usage counters. Never gates admission.
    pub async fn record_message(&self, user_id: &str, connection_id: &str) {
        let now = self.now_ms();
        let minute = UsageWindow::Minute.index(now);
        let hour = UsageWindow::Hour.index(now);
        let counters = [
            (self.keys.usage(user_id, UsageWindow::Minute, minute), MINUTE_USAGE_TTL),
            (self.keys.usage(user_id, UsageWindow::Hour, hour), HOUR_USAGE_TTL),
            (self.keys.usage_total(minute), MINUTE_USAGE_TTL),
        ];
        for (key, ttl) in &counters {
            if let Err(e) = self.store.incr_with_ttl(key, *ttl).await {
                warn!(user_id, connection_id, key = %key, %e, "Failed to record message usage");
                return;
            }
        }
    }

    /// Put a user in the penalty box. Returns the penalty end (epoch ms).
    ///
    /// Durations above [`MAX_PENALTY_DURATION_MS`] are rejected.
    pub async fn apply_penalty(&self, user_id: &str, duration_ms: Option<u64>) -> Result<i64> {
        let duration_ms =
            duration_ms.unwrap_or(self.config.read().await.penalty_duration_ms).max(1);
        if duration_ms > MAX_PENALTY_DURATION_MS {
            return Err(RelayError::RateLimit(format!(
                "penalty of {duration_ms} ms exceeds the {MAX_PENALTY_DURATION_MS} ms maximum"
            )));
        }
        let until = self.now_ms().saturating_add(duration_ms as i64);
        self.store
            .set_with_ttl(
                &self.keys.penalty(user_id),
                &until.to_string(),
                Duration::from_millis(duration_ms),
            )
            .await?;
        info!(user_id, penalty_until = until, "Penalty applied");
        Ok(until)
    }

    /// Lift a penalty and reset the user's bucket to full. Failures are logged.
    pub async fn remove_penalty(&self, user_id: &str) {
        for key in [self.keys.penalty(user_id), self.keys.bucket(user_id)] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(user_id, key = %key, %e, "Failed to remove penalty");
                return;
            }
        }
        info!(user_id, "Penalty removed");
    }

    async fn active_penalty(&self, user_id: &str, now: i64) -> Result<Option<i64>> {
        let raw = self.store.get(&self.keys.penalty(user_id)).await?;
        Ok(raw
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|until| *until > now))
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn get_rate_limit_status(&self, user_id: &str) -> Result<RateLimitStatus> {
        let config = self.get_config().await;
        let policy = BucketPolicy::from_config(&config);
        let now = self.now_ms();

        let mut state = self
            .store
            .bucket_state(&self.keys.bucket(user_id))
            .await?
            .unwrap_or_else(|| BucketState::full(&policy, now));
        state.refill(&policy, now);

        let penalty_until = self.active_penalty(user_id, now).await?;
        let connections = self
            .store
            .set_cardinality(&self.keys.connections(ConnectionScope::User, user_id))
            .await?;
        let minute = self
            .counter(&self.keys.usage(user_id, UsageWindow::Minute, UsageWindow::Minute.index(now)))
            .await?;
        let hour = self
            .counter(&self.keys.usage(user_id, UsageWindow::Hour, UsageWindow::Hour.index(now)))
            .await?;

        Ok(RateLimitStatus {
            user_id: user_id.to_string(),
            tokens: state.tokens,
            capacity: policy.capacity(),
            penalized: penalty_until.is_some(),
            penalty_until,
            connections,
            max_connections: config.max_connections_per_user,
            messages_this_minute: minute,
            messages_this_hour: hour,
        })
    }

    /// Aggregate over the last `period_minutes` minutes (current minute
    /// included), clamped to the lifetime of the per-minute totals.
    pub async fn get_stats(&self, period_minutes: u32) -> Result<RateLimitStats> {
        let period_minutes = period_minutes.clamp(1, MAX_STATS_PERIOD_MINUTES);
        let now = self.now_ms();
        let current = UsageWindow::Minute.index(now);
        let mut total_messages = 0;
        for offset in 0..period_minutes as i64 {
            total_messages += self.counter(&self.keys.usage_total(current - offset)).await?;
        }

        let mut active_penalties = 0;
        for key in self.store.scan_keys(&self.keys.penalty_pattern()).await? {
            let until = self.store.get(&key).await?.and_then(|v| v.parse::<i64>().ok());
            if until.is_some_and(|until| until > now) {
                active_penalties += 1;
            }
        }

        let mut connected_users = 0;
        let mut total_connections = 0;
        for key in self
            .store
            .scan_keys(&self.keys.connections_pattern(ConnectionScope::User))
            .await?
        {
            let count = self.store.set_cardinality(&key).await?;
            if count > 0 {
                connected_users += 1;
                total_connections += count;
            }
        }
        let connected_ips = self
            .store
            .scan_keys(&self.keys.connections_pattern(ConnectionScope::Ip))
            .await?
            .len();

        Ok(RateLimitStats {
            period_minutes,
            total_messages,
            active_penalties,
            connected_users,
            connected_ips,
            total_connections,
            config: self.get_config().await,
        })
    }

    /// Delete usage counters whose window ended more than `older_than_hours`
    /// ago. Returns the number of keys deleted.
    pub async fn cleanup(&self, older_than_hours: u64) -> Result<usize> {
        let retention_ms = i64::try_from(older_than_hours)
            .unwrap_or(i64::MAX)
            .saturating_mul(3_600_000);
        let cutoff = self.now_ms().saturating_sub(retention_ms);
        let mut deleted = 0;
        for key in self.store.scan_keys(&self.keys.usage_pattern()).await? {
            let Some((window, start_ms)) = self.keys.parse_usage_key(&key) else {
                continue;
            };
            if start_ms + window.millis() <= cutoff {
                self.store.delete(&key).await?;
                deleted += 1;
            }
        }
        info!(deleted, older_than_hours, "Rate limit cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_relay_core::memory_store::MemoryStore;
    use std::sync::atomic::{AtomicI64, Ordering};

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        store: MemoryStore,
        now: Arc<AtomicI64>,
        limiter: RateLimiter,
    }

    impl Harness {
        fn new(config: RateLimitConfig) -> Self {
            let store = MemoryStore::new();
            let now = Arc::new(AtomicI64::new(T0));
            let clock_now = now.clone();
            let limiter = RateLimiter::with_clock(
                Arc::new(store.clone()),
                config,
                Arc::new(move || clock_now.load(Ordering::SeqCst)),
            );
            Self { store, now, limiter }
        }

        fn advance(&self, ms: i64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_burst_then_denials_then_penalty() {
        let h = Harness::new(RateLimitConfig::default());

        for i in 0..30 {
            let r = h.limiter.check_message_rate_limit("u1", None).await;
            assert!(r.allowed, "message {i} should be admitted");
        }
        let first = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(!first.allowed);
        assert_eq!(first.reason.as_deref(), Some(REASON_RATE_LIMITED));
        assert_eq!(first.reset_time, T0 + 6000);

        for _ in 31..50 {
            let r = h.limiter.check_message_rate_limit("u1", None).await;
            assert!(!r.allowed);
            assert!(r.penalty_until.is_none());
        }
        let tipped = h.limiter.check_message_rate_limit("u1", None).await;
        assert_eq!(tipped.reason.as_deref(), Some(REASON_PENALTY_APPLIED));
        assert_eq!(tipped.penalty_until, Some(T0 + 5000));

        h.advance(1000);
        let boxed = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(!boxed.allowed);
        assert_eq!(boxed.reason.as_deref(), Some(REASON_PENALIZED));
        assert_eq!(boxed.reset_time, T0 + 5000);
    }

    #[tokio::test]
    async fn test_allowed_reset_time_is_when_bucket_is_full() {
        let h = Harness::new(RateLimitConfig::default());
        let r = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(r.allowed);
        assert_eq!(r.remaining, 29);
        assert_eq!(r.reset_time, T0 + 6000);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let h = Harness::new(RateLimitConfig {
            burst_allowance: 0,
            max_messages_per_second: 1,
            ..Default::default()
        });
        assert!(h.limiter.check_message_rate_limit("a", None).await.allowed);
        assert!(!h.limiter.check_message_rate_limit("a", None).await.allowed);
        assert!(h.limiter.check_message_rate_limit("b", None).await.allowed);
    }

    #[tokio::test]
    async fn test_connection_cap_and_registered_connection_passes() {
        let h = Harness::new(RateLimitConfig {
            max_connections_per_user: 2,
            ..Default::default()
        });
        h.limiter.register_connection("u1", "c1", None).await.unwrap();
        h.limiter.register_connection("u1", "c2", None).await.unwrap();

        let r = h
            .limiter
            .check_connection_limit("u1", ConnectionScope::User)
            .await;
        assert!(!r.allowed);
        assert_eq!(r.remaining, 0);
        assert_eq!(r.reason.as_deref(), Some(REASON_CONNECTION_LIMIT));

        assert!(!h.limiter.check_rate_limit("u1", Some("c3"), None).await);
        assert!(h.limiter.check_rate_limit("u1", Some("c1"), None).await);

        h.limiter.unregister_connection("u1", "c2", None).await;
        assert!(h.limiter.check_rate_limit("u1", Some("c3"), None).await);
    }

    #[tokio::test]
    async fn test_ip_quota_normalizes_brackets() {
        let h = Harness::new(RateLimitConfig {
            max_connections_per_ip: 1,
            ..Default::default()
        });
        h.limiter
            .register_connection("u1", "c1", Some("[::1]"))
            .await
            .unwrap();
        let r = h.limiter.check_connection_limit("::1", ConnectionScope::Ip).await;
        assert!(!r.allowed);
        assert!(!h.limiter.check_rate_limit("u2", Some("c9"), Some("::1")).await);
        assert!(h.limiter.check_rate_limit("u2", Some("c9"), Some("10.0.0.1")).await);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_unavailable() {
        let h = Harness::new(RateLimitConfig::default());
        h.store.set_available(false);

        assert!(h.limiter.check_rate_limit("u1", Some("c1"), Some("10.0.0.1")).await);
        let r = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(r.allowed);
        assert_eq!(r.reason.as_deref(), Some(REASON_FAIL_OPEN));
        assert!(
            h.limiter
                .check_connection_limit("u1", ConnectionScope::User)
                .await
                .allowed
        );
        // Neither of these surfaces an error.
        h.limiter.record_message("u1", "c1").await;
        h.limiter.remove_penalty("u1").await;
    }

    #[tokio::test]
    async fn test_manual_penalty_and_pardon() {
        let h = Harness::new(RateLimitConfig::default());
        let until = h.limiter.apply_penalty("u1", Some(60_000)).await.unwrap();
        assert_eq!(until, T0 + 60_000);

        let r = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(!r.allowed);
        assert_eq!(r.penalty_until, Some(until));
        let status = h.limiter.get_rate_limit_status("u1").await.unwrap();
        assert!(status.penalized);

        h.limiter.remove_penalty("u1").await;
        let r = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(r.allowed);
        assert_eq!(r.remaining, 29);
    }

    #[tokio::test]
    async fn test_status_and_stats_reflect_usage() {
        let h = Harness::new(RateLimitConfig::default());
        h.limiter.register_connection("u1", "c1", Some("10.0.0.1")).await.unwrap();
        h.limiter.register_connection("u2", "c2", None).await.unwrap();
        for _ in 0..3 {
            h.limiter.check_message_rate_limit("u1", Some("c1")).await;
            h.limiter.record_message("u1", "c1").await;
        }
        h.limiter.record_message("u2", "c2").await;
        h.limiter.apply_penalty("u3", None).await.unwrap();

        let status = h.limiter.get_rate_limit_status("u1").await.unwrap();
        assert_eq!(status.tokens, 27);
        assert_eq!(status.capacity, 30);
        assert_eq!(status.connections, 1);
        assert_eq!(status.messages_this_minute, 3);
        assert_eq!(status.messages_this_hour, 3);
        assert!(!status.penalized);

        let stats = h.limiter.get_stats(5).await.unwrap();
        assert_eq!(stats.total_messages, 4);
        assert_eq!(stats.active_penalties, 1);
        assert_eq!(stats.connected_users, 2);
        assert_eq!(stats.connected_ips, 1);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.config, RateLimitConfig::default());
    }

    #[tokio::test]
    async fn test_unknown_user_status_is_full_bucket() {
        let h = Harness::new(RateLimitConfig::default());
        let status = h.limiter.get_rate_limit_status("ghost").await.unwrap();
        assert_eq!(status.tokens, status.capacity);
        assert_eq!(status.connections, 0);
        assert_eq!(status.messages_this_minute, 0);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_only_expired_windows() {
        let h = Harness::new(RateLimitConfig::default());
        let keys = h.limiter.keys().clone();
        let old_minute = UsageWindow::Minute.index(T0 - 30 * 3_600_000);
        let old_hour = UsageWindow::Hour.index(T0 - 30 * 3_600_000);
        let ttl = Duration::from_secs(3600);
        h.store
            .incr_with_ttl(&keys.usage("u1", UsageWindow::Minute, old_minute), ttl)
            .await
            .unwrap();
        h.store
            .incr_with_ttl(&keys.usage("u1", UsageWindow::Hour, old_hour), ttl)
            .await
            .unwrap();
        h.store.incr_with_ttl(&keys.usage_total(old_minute), ttl).await.unwrap();
        h.limiter.record_message("u1", "c1").await;

        assert_eq!(h.limiter.cleanup(24).await.unwrap(), 3);
        assert_eq!(h.limiter.cleanup(24).await.unwrap(), 0);
        let status = h.limiter.get_rate_limit_status("u1").await.unwrap();
        assert_eq!(status.messages_this_minute, 1);
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let h = Harness::new(RateLimitConfig::default());
        let err = h
            .limiter
            .update_config(&RateLimitConfigPatch {
                max_messages_per_second: Some(0),
                ..Default::default()
            })
            .await;
        assert!(err.is_err());
        assert_eq!(h.limiter.get_config().await.max_messages_per_second, 10);

        let updated = h
            .limiter
            .update_config(&RateLimitConfigPatch {
                burst_allowance: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.burst_allowance, 0);

        for _ in 0..10 {
            assert!(h.limiter.check_message_rate_limit("u1", None).await.allowed);
        }
        assert!(!h.limiter.check_message_rate_limit("u1", None).await.allowed);
    }

    #[tokio::test]
    async fn test_shrinking_burst_caps_a_full_bucket() {
        let h = Harness::new(RateLimitConfig::default());
        assert!(h.limiter.check_message_rate_limit("u1", None).await.allowed);

        h.limiter
            .update_config(&RateLimitConfigPatch {
                burst_allowance: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut admitted = 0;
        for _ in 0..40 {
            if h.limiter.check_message_rate_limit("u1", None).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_rejected_connection_spends_no_token() {
        let h = Harness::new(RateLimitConfig {
            max_connections_per_user: 1,
            ..Default::default()
        });
        h.limiter.register_connection("u1", "c1", None).await.unwrap();
        for _ in 0..60 {
            assert!(!h.limiter.check_rate_limit("u1", Some("c2"), None).await);
        }
        let status = h.limiter.get_rate_limit_status("u1").await.unwrap();
        assert_eq!(status.tokens, status.capacity);
        assert!(!status.penalized);
    }

    #[tokio::test]
    async fn test_remaining_saturates_for_huge_capacity() {
        let h = Harness::new(RateLimitConfig {
            max_messages_per_second: u32::MAX,
            burst_allowance: u32::MAX,
            ..Default::default()
        });
        let r = h.limiter.check_message_rate_limit("u1", None).await;
        assert!(r.allowed);
        assert_eq!(r.remaining, u32::MAX);
    }

    #[tokio::test]
    async fn test_apply_penalty_rejects_out_of_range_duration() {
        let h = Harness::new(RateLimitConfig::default());
        assert!(h.limiter.apply_penalty("u1", Some(u64::MAX)).await.is_err());
        assert!(!h.limiter.get_rate_limit_status("u1").await.unwrap().penalized);

        let until = h
            .limiter
            .apply_penalty("u1", Some(MAX_PENALTY_DURATION_MS))
            .await
            .unwrap();
        assert_eq!(until, T0 + MAX_PENALTY_DURATION_MS as i64);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_deletes_nothing() {
        let h = Harness::new(RateLimitConfig::default());
        h.limiter.record_message("u1", "c1").await;
        assert_eq!(h.limiter.cleanup(u64::MAX).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_period_is_clamped_to_counter_lifetime() {
        let h = Harness::new(RateLimitConfig::default());
        h.limiter.record_message("u1", "c1").await;

        let stats = h.limiter.get_stats(u32::MAX).await.unwrap();
        assert_eq!(stats.period_minutes, MAX_STATS_PERIOD_MINUTES);
        assert_eq!(stats.period_minutes, 120);
        assert_eq!(stats.total_messages, 1);

        assert_eq!(h.limiter.get_stats(0).await.unwrap().period_minutes, 1);
    }
}
