//! Typed payloads carried inside broadcast events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Attachment, DeliveryStatus, Reaction};
use crate::moderation::{ModerationAction, ModerationRule, Severity};

/// `message-deleted` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub message_id: Uuid,
    pub deleted_by: Uuid,
}

/// Phase reported by an `attachment-status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Uploading,
    Complete,
    Error,
    Deleted,
}

/// `attachment-status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStatusPayload {
    pub attachment_id: Uuid,
    pub message_id: Uuid,
    pub status: UploadPhase,
    /// Percent complete, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttachmentStatusPayload {
    pub(crate) fn new(attachment: &Attachment, status: UploadPhase) -> Self {
        let progress = match status {
            UploadPhase::Uploading => Some(0),
            UploadPhase::Complete => Some(100),
            UploadPhase::Error | UploadPhase::Deleted => None,
        };
        Self {
            attachment_id: attachment.id,
            message_id: attachment.message_id,
            status,
            progress,
            filename: attachment.filename.clone(),
            file_url: attachment.file_url.clone(),
            error: attachment.error.clone(),
        }
    }
}

/// `delivery-status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusPayload {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: DeliveryStatus,
}

/// `moderation-violation` payload. Carries the rule, never the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationViolationPayload {
    pub rule_id: Uuid,
    pub user_id: Uuid,
    pub action: ModerationAction,
    pub severity: Severity,
    pub reason: String,
}

impl ModerationViolationPayload {
    pub(crate) fn new(rule: &ModerationRule, user_id: Uuid) -> Self {
        Self {
            rule_id: rule.id,
            user_id,
            action: rule.action,
            severity: rule.severity,
            reason: rule.description.clone(),
        }
    }
}

/// `reaction-added` / `reaction-removed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
}

impl From<&Reaction> for ReactionPayload {
    fn from(reaction: &Reaction) -> Self {
        Self {
            message_id: reaction.message_id,
            user_id: reaction.user_id,
            emoji: reaction.emoji.clone(),
        }
    }
}
