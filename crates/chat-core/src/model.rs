//! Persisted entities for channels, messages, reactions, deliveries and
//! attachments.
//!
//! These are plain data; the store owns them and the components above it
//! pass them around by value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 100;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.chars().count() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Channel visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Public,
    Private,
    Direct,
}

/// A named container for messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub kind: ChannelKind,
    pub creator_id: Uuid,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Channel {
    /// Create a live, unarchived channel.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ChannelKind, creator_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            creator_id,
            is_archived: false,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    /// Whether the channel has been soft-deleted.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether new messages may be posted.
    #[inline]
    #[must_use]
    pub fn accepts_messages(&self) -> bool {
        !self.is_archived && !self.is_deleted()
    }
}

/// A member's role within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    /// Owners and admins may act on other members' content.
    #[inline]
    #[must_use]
    pub fn can_moderate(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// Membership of a user in a channel. Unique per (channel, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

impl ChannelMember {
    #[must_use]
    pub fn new(channel_id: Uuid, user_id: Uuid, role: MemberRole) -> Self {
        Self {
            channel_id,
            user_id,
            role,
            joined_at: Utc::now(),
        }
    }
}

/// Message content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// A message posted to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub parent_id: Option<Uuid>,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new, unsaved message.
    #[must_use]
    pub fn new(
        channel_id: Uuid,
        author_id: Uuid,
        content: impl Into<String>,
        kind: MessageKind,
        parent_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel_id,
            author_id,
            content: content.into(),
            kind,
            parent_id,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether the message is a thread reply.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Pagination and filtering for channel history reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Only messages older than this one. Unlike `before`, messages sharing
    /// the cursor's timestamp are not skipped.
    pub before_id: Option<Uuid>,
    /// Maximum number of messages returned, newest first.
    pub limit: usize,
    /// Whether soft-deleted messages are included.
    pub include_deleted: bool,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            before: None,
            before_id: None,
            limit: 50,
            include_deleted: false,
        }
    }
}

/// A reaction. Unique per (message, user, emoji).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Progress of a message toward one recipient.
///
/// Ordered `Sent < Delivered < Read`; a record only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// Per-(message, recipient) delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
}

/// Result of a conditional status advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    /// The record as stored after the call.
    pub record: DeliveryRecord,
    /// Whether the call moved the status forward.
    pub advanced: bool,
}

/// Upload lifecycle of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Uploading,
    Complete,
    Failed,
}

/// File metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub message_id: Uuid,
    pub channel_id: Uuid,
    pub uploader_id: Uuid,
    /// Name supplied by the client.
    pub filename: String,
    /// Collision-resistant name used with the blob store.
    pub storage_name: String,
    pub content_type: String,
    pub size: u64,
    pub is_image: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Identifier assigned by the blob store once the upload completes.
    pub file_id: Option<String>,
    pub file_url: Option<String>,
    pub status: AttachmentStatus,
    /// Failure reason, for `Failed` attachments.
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attachment {
    /// Whether a client may retry this upload.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.status == AttachmentStatus::Failed
    }
}
