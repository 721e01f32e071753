//! Storage capability interfaces.
//!
//! The core never talks to a database directly. Each component depends on the
//! narrow trait it needs, so production backends and the in-memory
//! implementation used by tests are interchangeable.

mod blob;
mod memory;

pub use blob::{LocalBlobStore, MemoryBlobStore};
pub use memory::{FailPoint, InMemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::model::{
    Attachment, Channel, ChannelMember, DeliveryRecord, DeliveryStatus, DeliveryUpdate, Message,
    MessageQuery, Reaction,
};
use crate::moderation::{ModerationRule, ModerationViolation, Restriction};

/// Durable store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness or referential constraint violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend failure.
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Channels, memberships, messages and reactions.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_channel(&self, channel: Channel) -> StoreResult<Channel>;

    async fn get_channel(&self, channel_id: Uuid) -> StoreResult<Option<Channel>>;

    async fn update_channel(&self, channel: Channel) -> StoreResult<Channel>;

    /// Insert a membership. Re-adding an existing member returns the stored
    /// row unchanged.
    async fn add_member(&self, member: ChannelMember) -> StoreResult<ChannelMember>;

    /// Returns whether a row was removed.
    async fn remove_member(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<bool>;

    async fn get_member(&self, channel_id: Uuid, user_id: Uuid)
        -> StoreResult<Option<ChannelMember>>;

    async fn get_channel_members(&self, channel_id: Uuid) -> StoreResult<Vec<ChannelMember>>;

    /// Ids of every live channel the user belongs to.
    async fn channels_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn create_message(&self, message: Message) -> StoreResult<Message>;

    /// Fetch a message, soft-deleted or not.
    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;

    async fn update_message(&self, message: Message) -> StoreResult<Message>;

    /// Soft-delete a message and return it.
    async fn delete_message(&self, message_id: Uuid) -> StoreResult<Message>;

    /// Hard-delete messages soft-deleted before `cutoff`. Returns the count.
    async fn purge_deleted_messages(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Channel history, newest first.
    async fn get_channel_messages(
        &self,
        channel_id: Uuid,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>>;

    /// Insert a reaction. Returns the stored row and whether it was new.
    async fn add_reaction(&self, reaction: Reaction) -> StoreResult<(Reaction, bool)>;

    /// Returns whether a row was removed.
    async fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str)
        -> StoreResult<bool>;

    async fn get_reactions(&self, message_id: Uuid) -> StoreResult<Vec<Reaction>>;
}

/// Delivery records. Owned exclusively by the delivery tracker.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Upsert `(message, user)` to `status` only if that moves it forward.
    async fn advance_delivery(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        status: DeliveryStatus,
    ) -> StoreResult<DeliveryUpdate>;

    async fn get_delivery(&self, message_id: Uuid, user_id: Uuid)
        -> StoreResult<Option<DeliveryRecord>>;

    /// Non-deleted messages in the channel not yet read by the user.
    async fn count_unread(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<usize>;

    /// Message ids that still have delivery records but no message row.
    async fn orphaned_delivery_messages(&self, limit: usize) -> StoreResult<Vec<Uuid>>;

    /// Remove every record for the given messages. Already-gone rows are
    /// ignored. Returns the number of records removed.
    async fn delete_deliveries_for(&self, message_ids: &[Uuid]) -> StoreResult<usize>;
}

/// Attachment metadata rows.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn create_attachment(&self, attachment: Attachment) -> StoreResult<Attachment>;

    async fn get_attachment(&self, attachment_id: Uuid) -> StoreResult<Option<Attachment>>;

    async fn update_attachment(&self, attachment: Attachment) -> StoreResult<Attachment>;

    /// Returns whether a row was removed.
    async fn delete_attachment(&self, attachment_id: Uuid) -> StoreResult<bool>;

    async fn attachments_for_message(&self, message_id: Uuid) -> StoreResult<Vec<Attachment>>;
}

/// Moderation rules, violations and restrictions. Acts as the rule source for
/// the moderation engine.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn list_rules(&self) -> StoreResult<Vec<ModerationRule>>;

    async fn create_rule(&self, rule: ModerationRule) -> StoreResult<ModerationRule>;

    async fn update_rule(&self, rule: ModerationRule) -> StoreResult<ModerationRule>;

    /// Returns whether a row was removed.
    async fn delete_rule(&self, rule_id: Uuid) -> StoreResult<bool>;

    async fn record_violation(&self, violation: ModerationViolation) -> StoreResult<()>;

    async fn violations_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ModerationViolation>>;

    /// Insert or extend a restriction for the same (user, channel, kind).
    async fn upsert_restriction(&self, restriction: Restriction) -> StoreResult<Restriction>;

    async fn active_restrictions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Restriction>>;
}

/// A boxed byte stream handed to the blob store.
pub type BlobReader<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

/// Where a blob ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub file_id: String,
    pub url: String,
    /// Bytes consumed from the stream.
    pub size: u64,
}

/// External file storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store_file(
        &self,
        reader: BlobReader<'_>,
        filename: &str,
        content_type: &str,
    ) -> std::io::Result<StoredBlob>;

    async fn delete_file(&self, file_id: &str) -> std::io::Result<()>;
}
