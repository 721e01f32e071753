//! Per-recipient delivery tracking.
//!
//! Every message gets one record per channel member. Records only move
//! forward (`sent < delivered < read`); the store's conditional advance makes
//! that hold no matter how calls interleave. A periodic sweep purges
//! long-deleted messages and the records they leave behind.

use chrono::Utc;
use pulse_chat_protocol::EventKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::events::DeliveryStatusPayload;
use crate::hub::Hub;
use crate::model::{DeliveryRecord, DeliveryStatus, Message};
use crate::store::{ChatStore, DeliveryStore};

/// Delivery tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How long soft-deleted messages are kept before the sweep purges them.
    pub retention_secs: u64,
    /// Time between sweeps.
    pub sweep_interval_secs: u64,
    /// Records removed per store round trip.
    pub sweep_batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            sweep_batch_size: 500,
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX / 1000))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Soft-deleted messages hard-deleted.
    pub purged_messages: usize,
    /// Delivery records removed.
    pub removed_deliveries: usize,
    /// Whether the sweep stopped early on cancellation.
    pub cancelled: bool,
}

/// Owns delivery records and emits `delivery-status` events.
pub struct DeliveryTracker {
    chat: Arc<dyn ChatStore>,
    deliveries: Arc<dyn DeliveryStore>,
    hub: Hub,
    config: DeliveryConfig,
}

impl DeliveryTracker {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatStore>,
        deliveries: Arc<dyn DeliveryStore>,
        hub: Hub,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            chat,
            deliveries,
            hub,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Create records for a new message: `sent` for every member, `read` for
    /// the author. Returns the number of records written.
    ///
    /// A failed write is logged and the remaining members are still seeded.
    ///
    /// # Errors
    ///
    /// Returns a store error if the member list cannot be read.
    pub async fn seed(&self, message: &Message) -> ChatResult<usize> {
        let members = self.chat.get_channel_members(message.channel_id).await?;
        let mut seeded = 0;
        let mut failed = 0;
        for member in &members {
            let status = if member.user_id == message.author_id {
                DeliveryStatus::Read
            } else {
                DeliveryStatus::Sent
            };
            match self
                .deliveries
                .advance_delivery(message.id, member.user_id, status)
                .await
            {
                Ok(update) if update.advanced => seeded += 1,
                Ok(_) => {}
                Err(e) => {
                    failed += 1;
                    warn!(
                        message = %message.id,
                        user = %member.user_id,
                        "Failed to seed delivery record: {}",
                        e
                    );
                }
            }
        }
        debug!(message = %message.id, recipients = seeded, failed, "Seeded delivery records");
        Ok(seeded)
    }

    async fn message(&self, message_id: Uuid) -> ChatResult<Message> {
        self.chat
            .get_message(message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message", message_id))
    }

    fn announce(&self, channel_id: Uuid, record: &DeliveryRecord) {
        self.hub.broadcast_to_channel(
            channel_id,
            EventKind::DeliveryStatus,
            &DeliveryStatusPayload {
                message_id: record.message_id,
                user_id: record.user_id,
                status: record.status,
            },
        );
    }

    /// Advance every member's record for the message to `delivered`.
    /// Records already `read` are left alone. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown message or a store error.
    pub async fn mark_delivered(&self, message_id: Uuid) -> ChatResult<usize> {
        let message = self.message(message_id).await?;
        let members = self.chat.get_channel_members(message.channel_id).await?;

        let mut changed = 0;
        for member in &members {
            let update = self
                .deliveries
                .advance_delivery(message_id, member.user_id, DeliveryStatus::Delivered)
                .await?;
            if update.advanced {
                changed += 1;
                self.announce(message.channel_id, &update.record);
            }
        }

        debug!(message = %message_id, changed, "Marked delivered");
        Ok(changed)
    }

    /// Advance the user's record to `read`. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown message, `Unauthorized` if the user
    /// is not in the message's channel, or a store error.
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<DeliveryRecord> {
        let message = self.message(message_id).await?;
        if self
            .chat
            .get_member(message.channel_id, user_id)
            .await?
            .is_none()
        {
            return Err(ChatError::Unauthorized(format!(
                "user {} is not a member of channel {}",
                user_id, message.channel_id
            )));
        }

        let update = self
            .deliveries
            .advance_delivery(message_id, user_id, DeliveryStatus::Read)
            .await?;
        if update.advanced {
            debug!(message = %message_id, user = %user_id, "Marked read");
            self.announce(message.channel_id, &update.record);
        }
        Ok(update.record)
    }

    /// Current record for a recipient.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn status(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<Option<DeliveryRecord>> {
        Ok(self.deliveries.get_delivery(message_id, user_id).await?)
    }

    /// Non-deleted messages in the channel the user has not read.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_unread_count(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<usize> {
        Ok(self.deliveries.count_unread(channel_id, user_id).await?)
    }

    /// Remove records whose message row no longer exists, in batches.
    /// Stops between batches once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns a store error; batches already removed stay removed.
    pub async fn cleanup_expired_deliveries(&self, cancel: &CancellationToken) -> ChatResult<usize> {
        let batch_size = self.config.sweep_batch_size.max(1);
        let mut removed = 0;

        while !cancel.is_cancelled() {
            let orphans = self.deliveries.orphaned_delivery_messages(batch_size).await?;
            if orphans.is_empty() {
                break;
            }
            removed += self.deliveries.delete_deliveries_for(&orphans).await?;
            if orphans.len() < batch_size {
                break;
            }
        }

        Ok(removed)
    }

    /// Purge messages deleted longer than the retention period ago, then
    /// remove their delivery records.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn purge_and_sweep(&self, cancel: &CancellationToken) -> ChatResult<SweepReport> {
        let cutoff = Utc::now() - self.config.retention();
        let purged_messages = self.chat.purge_deleted_messages(cutoff).await?;
        let removed_deliveries = self.cleanup_expired_deliveries(cancel).await?;

        Ok(SweepReport {
            purged_messages,
            removed_deliveries,
            cancelled: cancel.is_cancelled(),
        })
    }

    /// Sweep on the configured interval until cancelled.
    pub async fn run_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.sweep_interval_secs,
            retention_secs = self.config.retention_secs,
            "Delivery sweep started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.purge_and_sweep(&cancel).await {
                Ok(report) => {
                    if report.purged_messages > 0 || report.removed_deliveries > 0 {
                        info!(
                            purged = report.purged_messages,
                            removed = report.removed_deliveries,
                            "Delivery sweep pruned records"
                        );
                    }
                }
                Err(e) => warn!("Delivery sweep error: {}", e),
            }
        }

        info!("Delivery sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, ChannelKind, ChannelMember, MemberRole, MessageKind};
    use crate::model::DeliveryUpdate;
    use crate::store::{FailPoint, InMemoryStore, StoreResult};
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<InMemoryStore>,
        tracker: DeliveryTracker,
        channel: Channel,
        author: Uuid,
        reader: Uuid,
    }

    async fn fixture(config: DeliveryConfig) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let author = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let channel = store
            .create_channel(Channel::new("general", ChannelKind::Public, author))
            .await
            .unwrap();
        store
            .add_member(ChannelMember::new(channel.id, author, MemberRole::Owner))
            .await
            .unwrap();
        store
            .add_member(ChannelMember::new(channel.id, reader, MemberRole::Member))
            .await
            .unwrap();

        let tracker = DeliveryTracker::new(store.clone(), store.clone(), Hub::new(), config);
        Fixture {
            store,
            tracker,
            channel,
            author,
            reader,
        }
    }

    async fn post(f: &Fixture, content: &str) -> Message {
        let message = f
            .store
            .create_message(Message::new(f.channel.id, f.author, content, MessageKind::Text, None))
            .await
            .unwrap();
        f.tracker.seed(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_seed_marks_author_read() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = post(&f, "hello").await;

        let author = f.tracker.status(message.id, f.author).await.unwrap().unwrap();
        let reader = f.tracker.status(message.id, f.reader).await.unwrap().unwrap();
        assert_eq!(author.status, DeliveryStatus::Read);
        assert_eq!(reader.status, DeliveryStatus::Sent);

        assert_eq!(f.tracker.get_unread_count(f.channel.id, f.author).await.unwrap(), 0);
        assert_eq!(f.tracker.get_unread_count(f.channel.id, f.reader).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_seed_continues_past_failed_member() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = f
            .store
            .create_message(Message::new(f.channel.id, f.author, "hello", MessageKind::Text, None))
            .await
            .unwrap();

        f.store.fail_next(FailPoint::AdvanceDelivery, 1);
        assert_eq!(f.tracker.seed(&message).await.unwrap(), 1);

        let seeded = [
            f.tracker.status(message.id, f.author).await.unwrap(),
            f.tracker.status(message.id, f.reader).await.unwrap(),
        ];
        assert_eq!(seeded.iter().filter(|r| r.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = post(&f, "hello").await;

        let read = f.tracker.mark_read(message.id, f.reader).await.unwrap();
        assert_eq!(read.status, DeliveryStatus::Read);

        // Delivered after read changes nothing
        assert_eq!(f.tracker.mark_delivered(message.id).await.unwrap(), 0);
        let record = f.tracker.status(message.id, f.reader).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Read);
        assert!(record.updated_at >= read.updated_at);
    }

    #[tokio::test]
    async fn test_mark_delivered_counts_changes() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = post(&f, "hello").await;

        assert_eq!(f.tracker.mark_delivered(message.id).await.unwrap(), 1);
        assert_eq!(f.tracker.mark_delivered(message.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = post(&f, "hello").await;

        let first = f.tracker.mark_read(message.id, f.reader).await.unwrap();
        let second = f.tracker.mark_read(message.id, f.reader).await.unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(f.tracker.get_unread_count(f.channel.id, f.reader).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_errors() {
        let f = fixture(DeliveryConfig::default()).await;
        let message = post(&f, "hello").await;

        assert!(matches!(
            f.tracker.mark_read(Uuid::new_v4(), f.reader).await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            f.tracker.mark_read(message.id, Uuid::new_v4()).await,
            Err(ChatError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_purges_old_deleted_messages() {
        let f = fixture(DeliveryConfig {
            retention_secs: 0,
            sweep_batch_size: 1,
            ..Default::default()
        })
        .await;
        let kept = post(&f, "keep").await;
        let gone = post(&f, "gone").await;
        f.store.delete_message(gone.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = f
            .tracker
            .purge_and_sweep(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.purged_messages, 1);
        assert_eq!(report.removed_deliveries, 2);
        assert!(!report.cancelled);

        assert!(f.tracker.status(kept.id, f.reader).await.unwrap().is_some());
        assert!(f.tracker.status(gone.id, f.reader).await.unwrap().is_none());

        // A second sweep finds nothing
        let again = f
            .tracker
            .purge_and_sweep(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn test_cleanup_honors_cancellation() {
        let f = fixture(DeliveryConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(f.tracker.cleanup_expired_deliveries(&cancel).await.unwrap(), 0);
    }

    /// Delivery store that fires a token after the first batch is deleted.
    struct CancelAfterFirstBatch {
        inner: Arc<InMemoryStore>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl DeliveryStore for CancelAfterFirstBatch {
        async fn advance_delivery(
            &self,
            message_id: Uuid,
            user_id: Uuid,
            status: DeliveryStatus,
        ) -> StoreResult<DeliveryUpdate> {
            self.inner.advance_delivery(message_id, user_id, status).await
        }

        async fn get_delivery(
            &self,
            message_id: Uuid,
            user_id: Uuid,
        ) -> StoreResult<Option<DeliveryRecord>> {
            self.inner.get_delivery(message_id, user_id).await
        }

        async fn count_unread(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<usize> {
            self.inner.count_unread(channel_id, user_id).await
        }

        async fn orphaned_delivery_messages(&self, limit: usize) -> StoreResult<Vec<Uuid>> {
            self.inner.orphaned_delivery_messages(limit).await
        }

        async fn delete_deliveries_for(&self, message_ids: &[Uuid]) -> StoreResult<usize> {
            let removed = self.inner.delete_deliveries_for(message_ids).await?;
            self.cancel.cancel();
            Ok(removed)
        }
    }

    #[tokio::test]
    async fn test_sweep_stops_between_batches() {
        let f = fixture(DeliveryConfig {
            retention_secs: 0,
            sweep_batch_size: 1,
            ..Default::default()
        })
        .await;
        for content in ["one", "two", "three"] {
            let message = post(&f, content).await;
            f.store.delete_message(message.id).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let tracker = DeliveryTracker::new(
            f.store.clone(),
            Arc::new(CancelAfterFirstBatch {
                inner: f.store.clone(),
                cancel: cancel.clone(),
            }),
            Hub::new(),
            f.tracker.config().clone(),
        );

        let report = tracker.purge_and_sweep(&cancel).await.unwrap();
        assert_eq!(report.purged_messages, 3);
        // One message's records, author and reader
        assert_eq!(report.removed_deliveries, 2);
        assert!(report.cancelled);

        // The rest is picked up by the next sweep
        assert_eq!(f.store.orphaned_delivery_messages(10).await.unwrap().len(), 2);
        let rest = f
            .tracker
            .cleanup_expired_deliveries(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rest, 4);
    }

    #[tokio::test]
    async fn test_sweep_loop_stops_on_cancel() {
        let f = fixture(DeliveryConfig::default()).await;
        let tracker = Arc::new(f.tracker);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&tracker).run_sweep_loop(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
