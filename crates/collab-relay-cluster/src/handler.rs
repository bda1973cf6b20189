//! Inbound event interface between the coordinator and the gateway that owns
//! the client connections.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

/// Receives envelopes published by other instances.
///
/// The coordinator calls exactly one method per accepted envelope, never for
/// envelopes this instance published itself.
#[async_trait]
pub trait ClusterEventHandler: Send + Sync {
    async fn on_room_message(&self, room_id: &str, message: Value, exclude_connection_id: Option<&str>);

    async fn on_user_message(&self, user_id: &str, message: Value);

    async fn on_instance_sync(&self, origin_instance_id: &str, data: Value);

    async fn on_presence_update(&self, session_id: &str, user_id: &str, presence: Value);
}

/// An inbound cluster event as an owned value.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Room {
        room_id: String,
        message: Value,
        exclude_connection_id: Option<String>,
    },
    User {
        user_id: String,
        message: Value,
    },
    InstanceSync {
        origin_instance_id: String,
        data: Value,
    },
    Presence {
        session_id: String,
        user_id: String,
        presence: Value,
    },
}

/// Forwards every event onto an mpsc channel, for gateways that would rather
/// consume a stream than implement the trait.
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ClusterEvent) {
        // A dropped receiver means the gateway is shutting down.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl ClusterEventHandler for ChannelEventHandler {
    async fn on_room_message(&self, room_id: &str, message: Value, exclude_connection_id: Option<&str>) {
        self.forward(ClusterEvent::Room {
            room_id: room_id.to_string(),
            message,
            exclude_connection_id: exclude_connection_id.map(String::from),
        });
    }

    async fn on_user_message(&self, user_id: &str, message: Value) {
        self.forward(ClusterEvent::User {
            user_id: user_id.to_string(),
            message,
        });
    }

    async fn on_instance_sync(&self, origin_instance_id: &str, data: Value) {
        self.forward(ClusterEvent::InstanceSync {
            origin_instance_id: origin_instance_id.to_string(),
            data,
        });
    }

    async fn on_presence_update(&self, session_id: &str, user_id: &str, presence: Value) {
        self.forward(ClusterEvent::Presence {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            presence,
        });
    }
}

/// Logs every event. Used by a standalone node with no gateway attached.
pub struct TracingEventHandler;

#[async_trait]
impl ClusterEventHandler for TracingEventHandler {
    async fn on_room_message(&self, room_id: &str, message: Value, exclude_connection_id: Option<&str>) {
        info!(room_id, ?exclude_connection_id, %message, "Room message from cluster");
    }

    async fn on_user_message(&self, user_id: &str, message: Value) {
        info!(user_id, %message, "User message from cluster");
    }

    async fn on_instance_sync(&self, origin_instance_id: &str, data: Value) {
        info!(origin_instance_id, %data, "Instance sync from cluster");
    }

    async fn on_presence_update(&self, session_id: &str, user_id: &str, presence: Value) {
        info!(session_id, user_id, %presence, "Presence update from cluster");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_handler_forwards_events() {
        let (handler, mut rx) = ChannelEventHandler::new();
        handler
            .on_room_message("r1", json!({"op": "insert"}), Some("conn-9"))
            .await;
        handler.on_presence_update("s1", "u1", json!({"cursor": 4})).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ClusterEvent::Room {
                room_id: "r1".into(),
                message: json!({"op": "insert"}),
                exclude_connection_id: Some("conn-9".into()),
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::Presence { session_id, .. } if session_id == "s1"
        ));
    }

    #[tokio::test]
    async fn test_channel_handler_tolerates_dropped_receiver() {
        let (handler, rx) = ChannelEventHandler::new();
        drop(rx);
        handler.on_user_message("u", json!(null)).await;
    }
}
