//! Cluster coordinator: instance membership with TTL-based failure detection
//! and cross-instance message fan-out over the shared store.
//!
//! Each process runs exactly one coordinator. It owns its registration record,
//! its set of subscribed channels and its timers; everything else lives in the
//! shared store. Envelopes published by this instance are dropped on receipt,
//! so subscribing to a channel you also publish on never echoes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use collab_relay_core::config::Config;
use collab_relay_core::error::{RelayError, Result};
use collab_relay_core::protocol::{
    ClusterKeys, Envelope, EnvelopeKind, InstanceRecord, PresenceUpdate, RoomBroadcast,
    UserMessage,
};
use collab_relay_core::store::{SharedStore, StoreMessage, Subscription, SubscriptionHandle};

use crate::handler::ClusterEventHandler;
use crate::metrics;

/// Lifecycle of this instance's cluster membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Unregistered,
    Registered,
    Deregistered,
}

/// Identity and timing of one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub instance_id: String,
    pub hostname: String,
    pub keys: ClusterKeys,
    pub heartbeat_interval: Duration,
    pub instance_ttl: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        let cluster = config.cluster();
        let instance = config.instance.clone().unwrap_or_default();
        let hostname = instance.hostname.unwrap_or_else(local_hostname);
        let instance_id = instance
            .id
            .unwrap_or_else(|| generate_instance_id(&hostname));
        Self {
            instance_id,
            hostname,
            keys: ClusterKeys::new(cluster.key_prefix),
            heartbeat_interval: Duration::from_secs(cluster.heartbeat_interval_secs.max(1)),
            instance_ttl: Duration::from_secs(cluster.instance_ttl_secs.max(1)),
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `<hostname>-<pid>-<8 random hex>`: unique across restarts on one host.
pub fn generate_instance_id(hostname: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{hostname}-{}-{}", std::process::id(), &suffix[..8])
}

/// Read-only snapshot for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    pub instance_id: String,
    pub state: InstanceState,
    pub total_instances: usize,
    pub instances: Vec<InstanceRecord>,
    pub local_subscriptions: usize,
    pub uptime_secs: u64,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(EnvelopeKind),
    SelfOrigin,
    Malformed,
    UnknownType,
}

pub struct ClusterCoordinator {
    settings: CoordinatorSettings,
    pid: u32,
    start_time: DateTime<Utc>,
    store: Arc<dyn SharedStore>,
    handler: Arc<dyn ClusterEventHandler>,
    state: Mutex<InstanceState>,
    /// Channels this instance is subscribed to.
    channels: tokio::sync::Mutex<HashSet<String>>,
    subscription: RwLock<Option<Box<dyn SubscriptionHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClusterCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        handler: Arc<dyn ClusterEventHandler>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            settings,
            pid: std::process::id(),
            start_time: Utc::now(),
            store,
            handler,
            state: Mutex::new(InstanceState::Unregistered),
            channels: tokio::sync::Mutex::new(HashSet::new()),
            subscription: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    pub fn keys(&self) -> &ClusterKeys {
        &self.settings.keys
    }

    pub fn state(&self) -> InstanceState {
        *lock(&self.state)
    }

    /// Register, open the subscription connection, subscribe to the
    /// instance-sync topic, then start dispatch and heartbeat loops.
    ///
    /// Any failure here is fatal: a process that cannot register must not
    /// serve traffic.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register_instance().await?;

        let Subscription { handle, messages } = self.store.open_subscription().await?;
        *self.subscription.write().await = Some(handle);
        self.spawn_dispatch(messages);

        let sync_channel = self.settings.keys.instance_sync_channel();
        self.subscribe_channel(&sync_channel).await?;

        self.spawn_heartbeat();
        info!(
            instance_id = %self.settings.instance_id,
            heartbeat_secs = self.settings.heartbeat_interval.as_secs(),
            ttl_secs = self.settings.instance_ttl.as_secs(),
            "Cluster coordinator started"
        );
        Ok(())
    }

    fn record(&self, now: DateTime<Utc>) -> InstanceRecord {
        let mut record = InstanceRecord::new(
            &self.settings.instance_id,
            &self.settings.hostname,
            self.pid,
            self.start_time,
        );
        record.touch(now);
        record
    }

    async fn write_registration(&self) -> Result<()> {
        let keys = &self.settings.keys;
        let record = serde_json::to_string(&self.record(Utc::now()))?;
        self.store
            .set_with_ttl(
                &keys.instance_record(&self.settings.instance_id),
                &record,
                self.settings.instance_ttl,
            )
            .await?;
        self.store
            .set_add(&keys.active_instances(), &self.settings.instance_id)
            .await?;
        Ok(())
    }

    /// Write the TTL'd registration record and join the active set.
    pub async fn register_instance(&self) -> Result<()> {
        if let Err(e) = self.write_registration().await {
            error!(instance_id = %self.settings.instance_id, %e, "Failed to register instance");
            return Err(RelayError::Cluster(format!(
                "failed to register instance {}: {e}",
                self.settings.instance_id
            )));
        }
        *lock(&self.state) = InstanceState::Registered;
        info!(
            instance_id = %self.settings.instance_id,
            hostname = %self.settings.hostname,
            pid = self.pid,
            "Instance registered"
        );
        Ok(())
    }

    /// Refresh the registration record and active-set membership.
    pub async fn heartbeat(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.state() == InstanceState::Deregistered {
            return Ok(());
        }
        self.write_registration().await?;
        debug!(instance_id = %self.settings.instance_id, "Heartbeat");
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.settings.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.heartbeat().await {
                            metrics::record_heartbeat_failure();
                            warn!(
                                instance_id = %coordinator.settings.instance_id,
                                %e,
                                "Heartbeat failed, retrying next tick"
                            );
                        }
                    }
                }
            }
            debug!("Heartbeat loop stopped");
        });
        lock(&self.tasks).push(task);
    }

    fn spawn_dispatch(&self, mut messages: mpsc::UnboundedReceiver<StoreMessage>) {
        let handler = self.handler.clone();
        let instance_id = self.settings.instance_id.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = messages.recv() => match msg {
                        Some(msg) => {
                            dispatch_message(&msg, &instance_id, handler.as_ref()).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(instance_id = %instance_id, "Dispatch loop stopped");
        });
        lock(&self.tasks).push(task);
    }

    /// Instances whose registration record is still alive. Members of the
    /// active set whose record expired are pruned as a side effect.
    pub async fn get_active_instances(&self) -> Result<Vec<String>> {
        let active_key = self.settings.keys.active_instances();
        let members = self.store.set_members(&active_key).await?;
        let mut active = Vec::with_capacity(members.len());
        for id in members {
            if self
                .store
                .exists(&self.settings.keys.instance_record(&id))
                .await?
            {
                active.push(id);
                continue;
            }
            info!(instance_id = %id, "Pruning expired instance");
            if let Err(e) = self.store.set_remove(&active_key, &id).await {
                warn!(instance_id = %id, %e, "Failed to prune expired instance");
            }
        }
        metrics::record_active_instances(active.len());
        Ok(active)
    }

    /// Registration records of every active instance.
    pub async fn get_instance_details(&self) -> Result<Vec<InstanceRecord>> {
        let mut details = Vec::new();
        for id in self.get_active_instances().await? {
            let Some(raw) = self
                .store
                .get(&self.settings.keys.instance_record(&id))
                .await?
            else {
                // Expired between the membership check and this read.
                continue;
            };
            match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(record) => details.push(record),
                Err(e) => warn!(instance_id = %id, %e, "Unreadable instance record"),
            }
        }
        Ok(details)
    }

    pub async fn get_cluster_stats(&self) -> Result<ClusterStats> {
        let instances = self.get_instance_details().await?;
        Ok(ClusterStats {
            instance_id: self.settings.instance_id.clone(),
            state: self.state(),
            total_instances: instances.len(),
            instances,
            local_subscriptions: self.channels.lock().await.len(),
            uptime_secs: (Utc::now() - self.start_time).num_seconds().max(0) as u64,
        })
    }

    async fn publish(&self, kind: EnvelopeKind, channel: &str, data: Value) -> Result<Uuid> {
        let envelope = Envelope::new(kind, &self.settings.instance_id, data);
        let payload = envelope.to_json()?;
        match self.store.publish(channel, &payload).await {
            Ok(receivers) => {
                metrics::record_envelope_published(kind);
                debug!(
                    channel,
                    kind = kind.as_str(),
                    message_id = %envelope.message_id,
                    receivers,
                    "Envelope published"
                );
                Ok(envelope.message_id)
            }
            Err(e) => {
                error!(channel, kind = kind.as_str(), %e, "Failed to publish envelope");
                Err(e)
            }
        }
    }

    /// Fan a message out to every instance subscribed to the room.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        message: Value,
        exclude_connection_id: Option<&str>,
    ) -> Result<Uuid> {
        let data = serde_json::to_value(RoomBroadcast {
            room_id: room_id.to_string(),
            message,
            exclude_connection_id: exclude_connection_id.map(String::from),
        })?;
        let channel = self.settings.keys.room_channel(room_id);
        self.publish(EnvelopeKind::RoomBroadcast, &channel, data).await
    }

    pub async fn send_to_user(&self, user_id: &str, message: Value) -> Result<Uuid> {
        let data = serde_json::to_value(UserMessage {
            user_id: user_id.to_string(),
            message,
        })?;
        let channel = self.settings.keys.user_channel(user_id);
        self.publish(EnvelopeKind::UserMessage, &channel, data).await
    }

    pub async fn broadcast_presence_update(
        &self,
        session_id: &str,
        user_id: &str,
        presence: Value,
    ) -> Result<Uuid> {
        let data = serde_json::to_value(PresenceUpdate {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            presence,
        })?;
        let channel = self.settings.keys.presence_channel(session_id);
        self.publish(EnvelopeKind::PresenceUpdate, &channel, data).await
    }

    /// Publish arbitrary state to every other instance.
    pub async fn sync_instance_state(&self, data: Value) -> Result<Uuid> {
        let channel = self.settings.keys.instance_sync_channel();
        self.publish(EnvelopeKind::InstanceSync, &channel, data).await
    }

    async fn subscribe_channel(&self, channel: &str) -> Result<()> {
        // Held across the store call so concurrent subscribes to one channel
        // reach the store once.
        let mut channels = self.channels.lock().await;
        if channels.contains(channel) {
            return Ok(());
        }
        let subscription = self.subscription.read().await;
        let Some(handle) = subscription.as_ref() else {
            return Err(RelayError::Cluster(
                "coordinator is not started: no subscription connection".into(),
            ));
        };
        if let Err(e) = handle.subscribe(channel).await {
            error!(channel, %e, "Failed to subscribe");
            return Err(e);
        }
        channels.insert(channel.to_string());
        debug!(channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) {
        let mut channels = self.channels.lock().await;
        if !channels.remove(channel) {
            return;
        }
        if let Some(handle) = self.subscription.read().await.as_ref() {
            if let Err(e) = handle.unsubscribe(channel).await {
                warn!(channel, %e, "Failed to unsubscribe");
                return;
            }
        }
        debug!(channel, "Unsubscribed");
    }

    pub async fn subscribe_to_room_channel(&self, room_id: &str) -> Result<()> {
        self.subscribe_channel(&self.settings.keys.room_channel(room_id))
            .await
    }

    pub async fn unsubscribe_from_room_channel(&self, room_id: &str) {
        self.unsubscribe_channel(&self.settings.keys.room_channel(room_id))
            .await
    }

    pub async fn subscribe_to_user_channel(&self, user_id: &str) -> Result<()> {
        self.subscribe_channel(&self.settings.keys.user_channel(user_id))
            .await
    }

    pub async fn unsubscribe_from_user_channel(&self, user_id: &str) {
        self.unsubscribe_channel(&self.settings.keys.user_channel(user_id))
            .await
    }

    pub async fn subscribe_to_presence_channel(&self, session_id: &str) -> Result<()> {
        self.subscribe_channel(&self.settings.keys.presence_channel(session_id))
            .await
    }

    pub async fn unsubscribe_from_presence_channel(&self, session_id: &str) {
        self.unsubscribe_channel(&self.settings.keys.presence_channel(session_id))
            .await
    }

    /// Sorted list of locally subscribed channels.
    pub async fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().await.iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Ordered, cooperative shutdown: stop timers, unsubscribe (best effort),
    /// leave the active set, delete the registration record, close the
    /// subscription connection.
    ///
    /// Every step runs even if an earlier one failed. Returns an error only if
    /// deregistration failed, in which case peers keep listing this instance
    /// until its TTL lapses.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state() == InstanceState::Deregistered {
            return Ok(());
        }
        let instance_id = &self.settings.instance_id;
        info!(instance_id = %instance_id, "Cluster coordinator shutting down");

        self.cancel.cancel();

        // A heartbeat already past its tick must not rewrite the record after
        // it is deleted below.
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let channels: Vec<String> = self.channels.lock().await.drain().collect();
        if let Some(handle) = self.subscription.read().await.as_ref() {
            for channel in &channels {
                if let Err(e) = handle.unsubscribe(channel).await {
                    warn!(channel = %channel, %e, "Failed to unsubscribe during shutdown");
                }
            }
        }

        let keys = &self.settings.keys;
        let mut deregister_error = None;
        if let Err(e) = self
            .store
            .set_remove(&keys.active_instances(), instance_id)
            .await
        {
            warn!(%e, "Failed to leave active instance set");
            deregister_error = Some(e);
        }
        if let Err(e) = self.store.delete(&keys.instance_record(instance_id)).await {
            warn!(%e, "Failed to delete instance record");
            deregister_error.get_or_insert(e);
        }

        if let Some(handle) = self.subscription.write().await.take() {
            if let Err(e) = handle.close().await {
                warn!(%e, "Failed to close subscription connection");
            }
        }

        *lock(&self.state) = InstanceState::Deregistered;
        info!(instance_id = %instance_id, "Cluster coordinator stopped");

        match deregister_error {
            Some(e) => Err(RelayError::Cluster(format!(
                "instance {instance_id} stopped but was not deregistered: {e}"
            ))),
            None => Ok(()),
        }
    }
}

/// Decode one inbound message and invoke the matching handler method.
///
/// Self-originated envelopes are dropped before their payload is decoded.
/// Malformed and unknown envelopes are logged and dropped.
pub async fn dispatch_message(
    msg: &StoreMessage,
    self_id: &str,
    handler: &dyn ClusterEventHandler,
) -> DispatchOutcome {
    let envelope = match Envelope::from_json(&msg.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(channel = %msg.channel, %e, "Dropping undecodable envelope");
            metrics::record_envelope_dropped("malformed");
            return DispatchOutcome::Malformed;
        }
    };

    if envelope.is_from(self_id) {
        metrics::record_envelope_dropped("self_origin");
        return DispatchOutcome::SelfOrigin;
    }

    let kind = envelope.kind;
    let delivered = match kind {
        EnvelopeKind::RoomBroadcast => match envelope.payload::<RoomBroadcast>() {
            Ok(p) => {
                handler
                    .on_room_message(&p.room_id, p.message, p.exclude_connection_id.as_deref())
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        EnvelopeKind::UserMessage => match envelope.payload::<UserMessage>() {
            Ok(p) => {
                handler.on_user_message(&p.user_id, p.message).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        EnvelopeKind::PresenceUpdate => match envelope.payload::<PresenceUpdate>() {
            Ok(p) => {
                handler
                    .on_presence_update(&p.session_id, &p.user_id, p.presence)
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        EnvelopeKind::InstanceSync => {
            handler
                .on_instance_sync(&envelope.origin_instance_id, envelope.data)
                .await;
            Ok(())
        }
        EnvelopeKind::Unknown => {
            warn!(
                channel = %msg.channel,
                origin = %envelope.origin_instance_id,
                "Dropping envelope of unknown type"
            );
            metrics::record_envelope_dropped("unknown_type");
            return DispatchOutcome::UnknownType;
        }
    };

    match delivered {
        Ok(()) => {
            metrics::record_envelope_received(kind);
            DispatchOutcome::Delivered(kind)
        }
        Err(e) => {
            warn!(channel = %msg.channel, kind = kind.as_str(), %e, "Dropping envelope with malformed payload");
            metrics::record_envelope_dropped("malformed");
            DispatchOutcome::Malformed
        }
    }
}
