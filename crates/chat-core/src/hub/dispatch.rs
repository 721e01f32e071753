//! Per-channel dispatcher.
//!
//! Each channel with live connections owns one task that consumes its bounded
//! event queue. Being the only writer for the channel, it preserves submission
//! order for every connection registered throughout.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::connection::{ConnectionId, ConnectionShared};
use super::{Hub, HubInner};

/// A connection's entry in a channel fan-out set.
#[derive(Clone)]
pub(crate) struct Member {
    pub(crate) sender: mpsc::Sender<Bytes>,
    pub(crate) shared: Arc<ConnectionShared>,
}

/// Fan-out set of a channel. The lock is taken for writes only by
/// registration paths; the dispatcher copies it and releases it before
/// delivering.
pub(crate) type Members = RwLock<HashMap<ConnectionId, Member>>;

/// Hub-wide counters updated by dispatchers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) dispatched_frames: AtomicU64,
    pub(crate) dropped_frames: AtomicU64,
    pub(crate) dropped_connections: AtomicU64,
}

/// Consume a channel's queue until every sender is gone.
pub(crate) async fn run(
    channel_id: Uuid,
    members: Arc<Members>,
    mut queue: mpsc::Receiver<Bytes>,
    counters: Arc<Counters>,
    hub: Weak<HubInner>,
) {
    debug!(channel = %channel_id, "Dispatcher started");

    while let Some(frame) = queue.recv().await {
        let targets: Vec<(ConnectionId, Member)> = members
            .read()
            .iter()
            .map(|(id, member)| (*id, member.clone()))
            .collect();

        let mut failed = Vec::new();
        for (id, member) in &targets {
            match member.sender.try_send(frame.clone()) {
                Ok(()) => member.shared.record_delivery(),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        channel = %channel_id,
                        connection = %id,
                        user = %member.shared.user_id,
                        "Outbound queue full, dropping connection"
                    );
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(channel = %channel_id, connection = %id, "Connection closed by peer");
                    failed.push(*id);
                }
            }
        }

        counters.dispatched_frames.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %channel_id, recipients = targets.len() - failed.len(), "Dispatched frame");

        if !failed.is_empty() {
            match hub.upgrade() {
                Some(inner) => {
                    let hub = Hub { inner };
                    for id in failed {
                        if hub.unregister(id) {
                            counters.dropped_connections.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                None => break,
            }
        }
    }

    debug!(channel = %channel_id, "Dispatcher stopped");
}
