//! Cluster wire protocol: envelopes exchanged between instances, instance
//! registration records, and the key/channel naming scheme shared by every
//! process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of an inter-instance envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    RoomBroadcast,
    UserMessage,
    InstanceSync,
    PresenceUpdate,
    /// Any kind this build does not know. Receivers log and drop it.
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoomBroadcast => "room_broadcast",
            Self::UserMessage => "user_message",
            Self::InstanceSync => "instance_sync",
            Self::PresenceUpdate => "presence_update",
            Self::Unknown => "unknown",
        }
    }
}

/// Structured message wrapper published on cluster channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub origin_instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: Uuid,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap `data` in a fresh envelope stamped with `origin` and the current time.
    pub fn new(kind: EnvelopeKind, origin: &str, data: serde_json::Value) -> Self {
        Self {
            kind,
            origin_instance_id: origin.to_string(),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
            data,
        }
    }

    pub fn is_from(&self, instance_id: &str) -> bool {
        self.origin_instance_id == instance_id
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decode the type-specific payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            crate::error::RelayError::Protocol(format!(
                "malformed {} payload: {e}",
                self.kind.as_str()
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomBroadcast {
    pub room_id: String,
    pub message: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub user_id: String,
    pub message: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub session_id: String,
    pub user_id: String,
    pub presence: serde_json::Value,
}

/// Liveness record written by each instance under a TTL'd key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Seconds since `start_time` at the last heartbeat.
    pub uptime: u64,
}

impl InstanceRecord {
    pub fn new(instance_id: &str, hostname: &str, pid: u32, start_time: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            hostname: hostname.to_string(),
            pid,
            start_time,
            last_heartbeat: start_time,
            uptime: 0,
        }
    }

    /// Refresh `last_heartbeat` and `uptime` to `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.uptime = (now - self.start_time).num_seconds().max(0) as u64;
    }
}

/// Key and channel names used by the cluster coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterKeys {
    prefix: String,
}

impl ClusterKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn room_channel(&self, room_id: &str) -> String {
        format!("{}:room:{room_id}", self.prefix)
    }

    pub fn user_channel(&self, user_id: &str) -> String {
        format!("{}:user:{user_id}", self.prefix)
    }

    pub fn presence_channel(&self, session_id: &str) -> String {
        format!("{}:presence:{session_id}", self.prefix)
    }

    pub fn instance_sync_channel(&self) -> String {
        format!("{}:instance_sync", self.prefix)
    }

    pub fn active_instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    pub fn instance_record(&self, instance_id: &str) -> String {
        format!("{}:instance:{instance_id}", self.prefix)
    }
}

/// Identity scope of a connection quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionScope {
    User,
    Ip,
}

impl ConnectionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ip => "ip",
        }
    }
}

/// Granularity of a usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageWindow {
    Minute,
    Hour,
}

impl UsageWindow {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Minute => "m",
            Self::Hour => "h",
        }
    }

    pub fn millis(&self) -> i64 {
        match self {
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
        }
    }

    /// Index of the window containing `now_ms`.
    pub fn index(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.millis())
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "m" => Some(Self::Minute),
            "h" => Some(Self::Hour),
            _ => None,
        }
    }
}

/// Key names used by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKeys {
    prefix: String,
}

impl RateLimitKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn bucket(&self, user_id: &str) -> String {
        format!("{}:bucket:{user_id}", self.prefix)
    }

    pub fn penalty(&self, user_id: &str) -> String {
        format!("{}:penalty:{user_id}", self.prefix)
    }

    pub fn penalty_pattern(&self) -> String {
        format!("{}:penalty:*", self.prefix)
    }

    pub fn connections(&self, scope: ConnectionScope, identifier: &str) -> String {
        let identifier = match scope {
            ConnectionScope::Ip => normalize_ip(identifier),
            ConnectionScope::User => identifier,
        };
        format!("{}:conn:{}:{identifier}", self.prefix, scope.as_str())
    }

    pub fn connections_pattern(&self, scope: ConnectionScope) -> String {
        format!("{}:conn:{}:*", self.prefix, scope.as_str())
    }

    pub fn usage(&self, user_id: &str, window: UsageWindow, index: i64) -> String {
        format!("{}:usage:{user_id}:{}:{index}", self.prefix, window.tag())
    }

    pub fn usage_total(&self, index: i64) -> String {
        format!("{}:usage_total:m:{index}", self.prefix)
    }

    /// Matches every per-user and cluster-wide usage counter.
    pub fn usage_pattern(&self) -> String {
        format!("{}:usage*", self.prefix)
    }

    /// Recover the window and its start time (epoch ms) from a usage key.
    pub fn parse_usage_key(&self, key: &str) -> Option<(UsageWindow, i64)> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(":usage")?;
        let mut parts = rest.rsplitn(3, ':');
        let index: i64 = parts.next()?.parse().ok()?;
        let window = UsageWindow::from_tag(parts.next()?)?;
        Some((window, index * window.millis()))
    }
}

/// Strip IPv6 brackets so `[::1]` and `::1` share a quota.
pub fn normalize_ip(ip: &str) -> &str {
    ip.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new(
            EnvelopeKind::RoomBroadcast,
            "node-a",
            json!({"roomId": "r1", "message": {"x": 1}}),
        );
        let value: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "room_broadcast");
        assert_eq!(value["originInstanceId"], "node-a");
        assert!(value["timestamp"].is_string());
        assert!(value["messageId"].is_string());
        assert_eq!(value["data"]["roomId"], "r1");
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let raw = r#"{"type":"cursor_burst","originInstanceId":"b","timestamp":"2024-01-01T00:00:00Z","messageId":"6f1c5b58-9d3b-4d8e-9f7a-0a8f3c2b1d4e","data":{}}"#;
        let env = Envelope::from_json(raw).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Unknown);
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let env = Envelope::new(EnvelopeKind::UserMessage, "a", json!({"nope": true}));
        let err = env.payload::<UserMessage>().unwrap_err();
        assert!(err.to_string().contains("user_message"));
    }

    #[test]
    fn test_room_payload_optional_exclude() {
        let env = Envelope::new(
            EnvelopeKind::RoomBroadcast,
            "a",
            json!({"roomId": "r", "message": "hi"}),
        );
        let payload: RoomBroadcast = env.payload().unwrap();
        assert_eq!(payload.exclude_connection_id, None);
    }

    #[test]
    fn test_channel_names() {
        let keys = ClusterKeys::new("collab:cluster");
        assert_eq!(keys.room_channel("r1"), "collab:cluster:room:r1");
        assert_eq!(keys.user_channel("u1"), "collab:cluster:user:u1");
        assert_eq!(keys.presence_channel("s1"), "collab:cluster:presence:s1");
        assert_eq!(keys.instance_sync_channel(), "collab:cluster:instance_sync");
        assert_eq!(keys.active_instances(), "collab:cluster:instances");
        assert_eq!(keys.instance_record("i1"), "collab:cluster:instance:i1");
    }

    #[test]
    fn test_ip_keys_are_normalized() {
        let keys = RateLimitKeys::new("rl");
        assert_eq!(
            keys.connections(ConnectionScope::Ip, "[::1]"),
            keys.connections(ConnectionScope::Ip, "::1")
        );
        assert_eq!(keys.connections(ConnectionScope::User, "u"), "rl:conn:user:u");
    }

    #[test]
    fn test_parse_usage_key() {
        let keys = RateLimitKeys::new("rl");
        let key = keys.usage("alice:smith", UsageWindow::Hour, 42);
        assert_eq!(
            keys.parse_usage_key(&key),
            Some((UsageWindow::Hour, 42 * 3_600_000))
        );
        let total = keys.usage_total(7);
        assert_eq!(keys.parse_usage_key(&total), Some((UsageWindow::Minute, 7 * 60_000)));
        assert_eq!(keys.parse_usage_key("rl:bucket:u"), None);
    }

    #[test]
    fn test_instance_record_touch() {
        let start = Utc::now();
        let mut record = InstanceRecord::new("i", "host", 42, start);
        record.touch(start + chrono::Duration::seconds(90));
        assert_eq!(record.uptime, 90);
        assert!(record.last_heartbeat > record.start_time);
    }
}
