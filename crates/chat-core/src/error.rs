//! Error taxonomy for the messaging core.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by core operations.
///
/// Validation, authorization and moderation failures are raised before any
/// mutation and are never retried.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Actor lacks permission for the mutation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Upload exceeds the configured byte limit.
    #[error("Attachment of {size} bytes exceeds the {max} byte limit")]
    AttachmentTooLarge { size: u64, max: u64 },

    /// Upload content type is outside the allow-list.
    #[error("Attachment type not allowed: {0}")]
    InvalidAttachmentType(String),

    /// Content rejected by a moderation rule.
    #[error("Message rejected: {reason}")]
    Moderated { rule_id: Option<uuid::Uuid>, reason: String },

    /// The operation was cancelled or ran past its deadline.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Durable store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Blob store failure.
    #[error("Blob storage error: {0}")]
    Blob(String),
}

impl ChatError {
    /// Get a static error code string for metrics labeling and wire replies.
    #[inline]
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::AttachmentTooLarge { .. } => "attachment_too_large",
            Self::InvalidAttachmentType(_) => "invalid_attachment_type",
            Self::Moderated { .. } => "moderated",
            Self::Cancelled(_) => "cancelled",
            Self::Storage(_) => "storage",
            Self::Blob(_) => "blob_storage",
        }
    }

    /// Whether the error was caused by the request itself rather than by
    /// infrastructure.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::Blob(_) | Self::Cancelled(_))
    }

    pub(crate) fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", what, id))
    }
}

/// Convenience alias for core results.
pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ChatError::Validation("x".into()).code(), "validation");
        assert_eq!(
            ChatError::AttachmentTooLarge { size: 3, max: 2 }.code(),
            "attachment_too_large"
        );
        assert_eq!(
            ChatError::Storage(StoreError::Backend("down".into())).code(),
            "storage"
        );
    }

    #[test]
    fn test_client_error_split() {
        assert!(ChatError::Unauthorized("no".into()).is_client_error());
        assert!(!ChatError::Blob("io".into()).is_client_error());
    }

    #[test]
    fn test_not_found_message() {
        let err = ChatError::not_found("Message", "42");
        assert_eq!(err.to_string(), "Message 42 not found");
    }
}
