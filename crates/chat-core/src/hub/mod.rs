//! Connection hub.
//!
//! The hub tracks live connections and the channels they listen on, and fans
//! broadcast events out to them. Every channel with at least one registered
//! connection owns a bounded dispatch queue drained by a single task, so
//! events reach each connection in the order they were submitted.
//!
//! ```text
//!   broadcast_to_channel ──encode──► [dispatch queue] ──► dispatcher
//!                                                            │ snapshot
//!                                      ┌─────────────────────┼──────────┐
//!                                      ▼                     ▼          ▼
//!                                 [outbound]            [outbound]  [outbound]
//!                                  conn A                conn B      conn C
//! ```
//!
//! A connection whose outbound queue is full or closed is unregistered by the
//! dispatcher; broadcasting never blocks the caller.

mod connection;
mod dispatch;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionState};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use pulse_chat_protocol::{codec, Event, EventKind};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use connection::ConnectionShared;
use dispatch::{Counters, Member, Members};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The connection was never created or has been unregistered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Maximum channels per connection reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Registration needs a Tokio runtime to start channel dispatchers.
    #[error("No Tokio runtime available")]
    NoRuntime,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity per connection, in frames.
    pub outbound_capacity: usize,
    /// Dispatch queue capacity per channel, in frames.
    pub dispatch_capacity: usize,
    /// Maximum channels a single connection may listen on.
    pub max_channels_per_connection: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            dispatch_capacity: 1024,
            max_channels_per_connection: 1000,
        }
    }
}

/// Outcome of a broadcast, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastReceipt {
    /// Handed to the channel dispatcher.
    Queued,
    /// Nobody is listening on the channel.
    NoListeners,
    /// The channel's dispatch queue was full; the event was dropped.
    DispatchQueueFull,
    /// The payload could not be serialized.
    EncodeFailed,
}

impl BroadcastReceipt {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, BroadcastReceipt::Queued)
    }
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Channels with at least one registered connection.
    pub channel_count: usize,
    /// Live connections.
    pub connection_count: usize,
    /// Sum of channel registrations over all connections.
    pub total_subscriptions: usize,
    /// Connections dropped because their queue was full or closed.
    pub dropped_connections: u64,
    /// Frames processed by dispatchers.
    pub dispatched_frames: u64,
    /// Frames dropped because a dispatch queue was full.
    pub dropped_frames: u64,
}

/// Fan-out state for one channel. Dropping it closes the dispatch queue and
/// lets the dispatcher finish.
struct ChannelFanout {
    members: Arc<Members>,
    queue: mpsc::Sender<Bytes>,
}

struct ConnectionSlot {
    shared: Arc<ConnectionShared>,
    sender: mpsc::Sender<Bytes>,
    channels: HashSet<Uuid>,
}

pub(crate) struct HubInner {
    config: HubConfig,
    channels: DashMap<Uuid, ChannelFanout>,
    connections: DashMap<ConnectionId, ConnectionSlot>,
    counters: Arc<Counters>,
}

/// Handle to the connection hub. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            inner: Arc::new(HubInner {
                config,
                channels: DashMap::new(),
                connections: DashMap::new(),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Open a connection for `user_id` with the configured queue capacity.
    #[must_use]
    pub fn connect(&self, user_id: Uuid) -> ConnectionHandle {
        self.connect_with_capacity(user_id, self.inner.config.outbound_capacity)
    }

    /// Open a connection with an explicit outbound queue capacity.
    #[must_use]
    pub fn connect_with_capacity(&self, user_id: Uuid, capacity: usize) -> ConnectionHandle {
        let id = ConnectionId::generate();
        let shared = Arc::new(ConnectionShared::new(id, user_id));
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        self.inner.connections.insert(
            id,
            ConnectionSlot {
                shared: Arc::clone(&shared),
                sender,
                channels: HashSet::new(),
            },
        );

        debug!(connection = %id, user = %user_id, "Connection opened");
        ConnectionHandle::new(shared, receiver, Arc::downgrade(&self.inner))
    }

    /// Add a connection to the fan-out set of each channel.
    ///
    /// Registering a channel twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownConnection`] if the connection is not live,
    /// [`HubError::MaxSubscriptionsReached`] past the per-connection limit.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        channel_ids: &[Uuid],
    ) -> Result<(), HubError> {
        let runtime = Handle::try_current().map_err(|_| HubError::NoRuntime)?;

        let mut slot = self
            .inner
            .connections
            .get_mut(&connection_id)
            .ok_or(HubError::UnknownConnection(connection_id))?;
        if !slot.shared.state().is_writable() {
            return Err(HubError::UnknownConnection(connection_id));
        }

        for channel_id in channel_ids {
            if slot.channels.contains(channel_id) {
                continue;
            }
            if slot.channels.len() >= self.inner.config.max_channels_per_connection {
                return Err(HubError::MaxSubscriptionsReached);
            }

            let fanout = self
                .inner
                .channels
                .entry(*channel_id)
                .or_insert_with(|| self.start_dispatcher(&runtime, *channel_id));
            fanout.members.write().insert(
                connection_id,
                Member {
                    sender: slot.sender.clone(),
                    shared: Arc::clone(&slot.shared),
                },
            );
            drop(fanout);

            slot.channels.insert(*channel_id);
            slot.shared.advance(ConnectionState::Registered);
            debug!(
                channel = %channel_id,
                connection = %connection_id,
                "Registered"
            );
        }

        Ok(())
    }

    fn start_dispatcher(&self, runtime: &Handle, channel_id: Uuid) -> ChannelFanout {
        let (queue, receiver) = mpsc::channel(self.inner.config.dispatch_capacity.max(1));
        let members = Arc::new(RwLock::new(HashMap::new()));

        runtime.spawn(dispatch::run(
            channel_id,
            Arc::clone(&members),
            receiver,
            Arc::clone(&self.inner.counters),
            Arc::downgrade(&self.inner),
        ));

        debug!(channel = %channel_id, "Creating channel fan-out");
        ChannelFanout { members, queue }
    }

    /// Remove a connection from every channel and release its outbound
    /// queue. Returns whether this call removed it.
    pub fn unregister(&self, connection_id: ConnectionId) -> bool {
        let Some((_, slot)) = self.inner.connections.remove(&connection_id) else {
            return false;
        };

        for channel_id in &slot.channels {
            self.leave_fanout(*channel_id, connection_id);
        }
        slot.shared.advance(ConnectionState::Draining);

        debug!(
            connection = %connection_id,
            user = %slot.shared.user_id,
            channels = slot.channels.len(),
            "Unregistered"
        );
        true
    }

    /// Remove one channel from a connection, keeping it connected.
    pub fn leave(&self, connection_id: ConnectionId, channel_id: Uuid) -> bool {
        let removed = self
            .inner
            .connections
            .get_mut(&connection_id)
            .map(|mut slot| slot.channels.remove(&channel_id))
            .unwrap_or(false);
        if removed {
            self.leave_fanout(channel_id, connection_id);
        }
        removed
    }

    fn leave_fanout(&self, channel_id: Uuid, connection_id: ConnectionId) {
        if let Some(fanout) = self.inner.channels.get(&channel_id) {
            fanout.members.write().remove(&connection_id);
        }
        let removed = self
            .inner
            .channels
            .remove_if(&channel_id, |_, fanout| fanout.members.read().is_empty());
        if removed.is_some() {
            debug!(channel = %channel_id, "Deleted empty channel fan-out");
        }
    }

    /// Register every live connection of `user_id` on `channel_id`.
    pub fn join_user(&self, user_id: Uuid, channel_id: Uuid) -> usize {
        let mut joined = 0;
        for connection_id in self.user_connections(user_id) {
            match self.register(connection_id, &[channel_id]) {
                Ok(()) => joined += 1,
                Err(e) => {
                    warn!(connection = %connection_id, channel = %channel_id, "Join failed: {}", e);
                }
            }
        }
        joined
    }

    /// Remove `channel_id` from every live connection of `user_id`.
    pub fn leave_user(&self, user_id: Uuid, channel_id: Uuid) -> usize {
        self.user_connections(user_id)
            .into_iter()
            .filter(|connection_id| self.leave(*connection_id, channel_id))
            .count()
    }

    /// Drop a channel's fan-out set and stop its dispatcher.
    pub fn remove_channel(&self, channel_id: Uuid) -> bool {
        let Some((_, fanout)) = self.inner.channels.remove(&channel_id) else {
            return false;
        };
        let members: Vec<ConnectionId> = fanout.members.read().keys().copied().collect();
        drop(fanout);

        for connection_id in &members {
            if let Some(mut slot) = self.inner.connections.get_mut(connection_id) {
                slot.channels.remove(&channel_id);
            }
        }

        debug!(channel = %channel_id, connections = members.len(), "Removed channel fan-out");
        true
    }

    /// Serialize `payload` into an event and hand it to the channel
    /// dispatcher.
    pub fn broadcast_to_channel<T: Serialize + ?Sized>(
        &self,
        channel_id: Uuid,
        kind: EventKind,
        payload: &T,
    ) -> BroadcastReceipt {
        match serde_json::to_value(payload) {
            Ok(payload) => self.broadcast(Event::new(kind, channel_id, payload)),
            Err(e) => {
                warn!(channel = %channel_id, kind = %kind, "Failed to serialize payload: {}", e);
                BroadcastReceipt::EncodeFailed
            }
        }
    }

    /// Hand a prepared event to its channel dispatcher.
    pub fn broadcast(&self, event: Event) -> BroadcastReceipt {
        let channel_id = event.channel_id;
        let Some(queue) = self
            .inner
            .channels
            .get(&channel_id)
            .map(|fanout| fanout.queue.clone())
        else {
            trace!(channel = %channel_id, kind = %event.kind, "No listeners");
            return BroadcastReceipt::NoListeners;
        };

        let frame = match codec::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %channel_id, kind = %event.kind, "Failed to encode event: {}", e);
                return BroadcastReceipt::EncodeFailed;
            }
        };

        match queue.try_send(frame) {
            Ok(()) => {
                trace!(channel = %channel_id, kind = %event.kind, "Queued event");
                BroadcastReceipt::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.inner.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %channel_id, kind = %event.kind, "Dispatch queue full, dropping event");
                BroadcastReceipt::DispatchQueueFull
            }
            Err(TrySendError::Closed(_)) => BroadcastReceipt::NoListeners,
        }
    }

    /// Live connection ids for a user.
    #[must_use]
    pub fn user_connections(&self, user_id: Uuid) -> Vec<ConnectionId> {
        self.inner
            .connections
            .iter()
            .filter(|slot| slot.shared.user_id == user_id)
            .map(|slot| *slot.key())
            .collect()
    }

    /// Channels a connection is registered on.
    #[must_use]
    pub fn connection_channels(&self, connection_id: ConnectionId) -> Vec<Uuid> {
        self.inner
            .connections
            .get(&connection_id)
            .map(|slot| slot.channels.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections registered on a channel.
    #[must_use]
    pub fn listener_count(&self, channel_id: Uuid) -> usize {
        self.inner
            .channels
            .get(&channel_id)
            .map(|fanout| fanout.members.read().len())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: ConnectionId) -> bool {
        self.inner.connections.contains_key(&connection_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let counters = &self.inner.counters;
        HubStats {
            channel_count: self.inner.channels.len(),
            connection_count: self.inner.connections.len(),
            total_subscriptions: self.inner.connections.iter().map(|s| s.channels.len()).sum(),
            dropped_connections: counters.dropped_connections.load(Ordering::Relaxed),
            dispatched_frames: counters.dispatched_frames.load(Ordering::Relaxed),
            dropped_frames: counters.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
