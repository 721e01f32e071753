//! Attachment uploads.
//!
//! An upload is checked against size and type limits before any byte is
//! read. The metadata row is written as `uploading` before the blob store is
//! called, and ends `complete` or `failed`; live clients follow along through
//! `attachment-status` events on the attachment's channel. An upload dropped
//! mid-flight (client gone, task aborted) is still recorded as `failed`.

mod probe;

pub use probe::{image_dimensions, PROBE_LIMIT};

use chrono::Utc;
use pulse_chat_protocol::EventKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::events::{AttachmentStatusPayload, UploadPhase};
use crate::hub::Hub;
use crate::model::{Attachment, AttachmentStatus};
use crate::store::{AttachmentStore, BlobStore, ChatStore, StoredBlob};

/// Longest extension kept in a storage name.
const MAX_EXTENSION_LENGTH: usize = 16;

/// Attachment pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Largest accepted upload, in bytes.
    pub max_size: u64,
    /// Accepted content types. `type/*` accepts a whole family.
    pub allowed_types: Vec<String>,
    /// Deadline for the blob store call.
    pub upload_timeout_secs: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024,
            allowed_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "image/bmp",
                "application/pdf",
                "application/zip",
                "text/plain",
                "audio/mpeg",
                "video/mp4",
            ]
            .iter()
            .map(|t| (*t).to_string())
            .collect(),
            upload_timeout_secs: 300,
        }
    }
}

impl AttachmentConfig {
    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Whether `content_type` is on the allow-list. Parameters such as
    /// `; charset=utf-8` are ignored.
    #[must_use]
    pub fn is_allowed(&self, content_type: &str) -> bool {
        let essence = essence(content_type);
        self.allowed_types.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            match allowed.strip_suffix("/*") {
                Some(family) => essence
                    .split_once('/')
                    .is_some_and(|(top, _)| top == family),
                None => allowed == essence,
            }
        })
    }
}

fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Last path segment of a client-supplied file name.
fn base_name(filename: &str) -> &str {
    filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename)
        .trim()
}

/// `<uuid>.<ext>` with the extension reduced to lowercase ASCII
/// alphanumerics.
#[must_use]
pub fn storage_name(filename: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    let ext: String = Path::new(base_name(filename))
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_LENGTH)
        .collect::<String>()
        .to_ascii_lowercase();

    if ext.is_empty() {
        id
    } else {
        format!("{}.{}", id, ext)
    }
}

/// Describes an incoming upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub content_type: String,
    /// Size declared by the client.
    pub size: u64,
    pub message_id: Uuid,
    pub channel_id: Uuid,
    pub uploader_id: Uuid,
}

/// Write the final status of an upload, retrying once.
async fn record_outcome(store: &dyn AttachmentStore, attachment: &Attachment) -> ChatResult<()> {
    if let Err(e) = store.update_attachment(attachment.clone()).await {
        warn!(attachment = %attachment.id, "Retrying attachment status update: {}", e);
        store.update_attachment(attachment.clone()).await?;
    }
    Ok(())
}

/// Marks an upload `failed` and removes its blob if the upload future is
/// dropped before recording an outcome.
struct PendingUpload {
    attachments: Arc<dyn AttachmentStore>,
    blobs: Arc<dyn BlobStore>,
    hub: Hub,
    attachment: Option<Attachment>,
}

impl PendingUpload {
    fn new(pipeline: &AttachmentPipeline, attachment: &Attachment) -> Self {
        Self {
            attachments: Arc::clone(&pipeline.attachments),
            blobs: Arc::clone(&pipeline.blobs),
            hub: pipeline.hub.clone(),
            attachment: Some(attachment.clone()),
        }
    }

    /// The outcome was recorded; nothing left to clean up.
    fn finish(mut self) {
        self.attachment = None;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(mut attachment) = self.attachment.take() else {
            return;
        };
        attachment.status = AttachmentStatus::Failed;
        attachment.error = Some("upload abandoned".into());
        attachment.updated_at = Utc::now();

        warn!(attachment = %attachment.id, "Upload abandoned before completion");
        self.hub.broadcast_to_channel(
            attachment.channel_id,
            EventKind::AttachmentStatus,
            &AttachmentStatusPayload::new(&attachment, UploadPhase::Error),
        );

        let Ok(runtime) = Handle::try_current() else {
            error!(attachment = %attachment.id, "No runtime to record abandoned upload");
            return;
        };
        let attachments = Arc::clone(&self.attachments);
        let blobs = Arc::clone(&self.blobs);
        runtime.spawn(async move {
            if let Err(e) = record_outcome(attachments.as_ref(), &attachment).await {
                error!(attachment = %attachment.id, "Failed to record abandoned upload: {}", e);
            }
            if let Err(e) = blobs.delete_file(&attachment.storage_name).await {
                warn!(attachment = %attachment.id, "Failed to delete abandoned blob: {}", e);
            }
        });
    }
}

/// Validates, stores and tracks attachments.
pub struct AttachmentPipeline {
    chat: Arc<dyn ChatStore>,
    attachments: Arc<dyn AttachmentStore>,
    blobs: Arc<dyn BlobStore>,
    hub: Hub,
    config: AttachmentConfig,
}

impl AttachmentPipeline {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatStore>,
        attachments: Arc<dyn AttachmentStore>,
        blobs: Arc<dyn BlobStore>,
        hub: Hub,
        config: AttachmentConfig,
    ) -> Self {
        Self {
            chat,
            attachments,
            blobs,
            hub,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AttachmentConfig {
        &self.config
    }

    fn announce(&self, attachment: &Attachment, phase: UploadPhase) {
        self.hub.broadcast_to_channel(
            attachment.channel_id,
            EventKind::AttachmentStatus,
            &AttachmentStatusPayload::new(attachment, phase),
        );
    }

    /// Reject the request before touching the reader or any store.
    fn validate(&self, request: &UploadRequest) -> ChatResult<()> {
        if request.size > self.config.max_size {
            return Err(ChatError::AttachmentTooLarge {
                size: request.size,
                max: self.config.max_size,
            });
        }
        if !self.config.is_allowed(&request.content_type) {
            return Err(ChatError::InvalidAttachmentType(request.content_type.clone()));
        }
        if base_name(&request.filename).is_empty() {
            return Err(ChatError::Validation("filename must not be empty".into()));
        }
        Ok(())
    }

    /// Store an upload and record its metadata.
    ///
    /// The reader is consumed up to one byte past the size limit. For images
    /// the first [`PROBE_LIMIT`] bytes are probed for dimensions and the
    /// reader is rewound before storing.
    ///
    /// # Errors
    ///
    /// - `AttachmentTooLarge`, `InvalidAttachmentType`, `Validation` before
    ///   any I/O.
    /// - `NotFound` if the message does not exist, `Validation` if it belongs
    ///   to another channel.
    /// - `Cancelled` on cancellation or timeout, `Blob` if the blob store
    ///   fails, `AttachmentTooLarge` if the stream outgrows the limit. The
    ///   metadata row is then left `failed` and any partial blob removed.
    ///
    /// Once the blob is stored the upload succeeds even if its `complete`
    /// status cannot be written after a retry; that failure is logged.
    pub async fn upload<R>(
        &self,
        request: UploadRequest,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> ChatResult<Attachment>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        self.validate(&request)?;

        let message = self
            .chat
            .get_message(request.message_id)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| ChatError::not_found("Message", request.message_id))?;
        if message.channel_id != request.channel_id {
            return Err(ChatError::Validation(format!(
                "message {} does not belong to channel {}",
                message.id, request.channel_id
            )));
        }

        let now = Utc::now();
        let content_type = essence(&request.content_type);
        let mut attachment = Attachment {
            id: Uuid::new_v4(),
            message_id: message.id,
            channel_id: message.channel_id,
            uploader_id: request.uploader_id,
            filename: base_name(&request.filename).to_string(),
            storage_name: storage_name(&request.filename),
            is_image: content_type.starts_with("image/"),
            content_type,
            size: request.size,
            width: None,
            height: None,
            file_id: None,
            file_url: None,
            status: AttachmentStatus::Uploading,
            error: None,
            uploaded_at: now,
            updated_at: now,
        };

        self.announce(&attachment, UploadPhase::Uploading);

        if attachment.is_image {
            match probe::read_prefix(&mut reader, PROBE_LIMIT).await {
                Ok(prefix) => {
                    if let Some((width, height)) = image_dimensions(&prefix) {
                        attachment.width = Some(width);
                        attachment.height = Some(height);
                    }
                }
                Err(e) => {
                    attachment.status = AttachmentStatus::Failed;
                    attachment.error = Some(format!("reading upload: {}", e));
                    self.announce(&attachment, UploadPhase::Error);
                    return Err(ChatError::Blob(format!("reading upload: {}", e)));
                }
            }
        }

        if let Err(e) = self.attachments.create_attachment(attachment.clone()).await {
            attachment.status = AttachmentStatus::Failed;
            attachment.error = Some(e.to_string());
            self.announce(&attachment, UploadPhase::Error);
            return Err(e.into());
        }

        debug!(
            attachment = %attachment.id,
            message = %attachment.message_id,
            content_type = %attachment.content_type,
            size = attachment.size,
            "Uploading attachment"
        );

        let pending = PendingUpload::new(self, &attachment);
        match self.store_blob(&attachment, &mut reader, cancel).await {
            Ok(blob) => {
                attachment.file_id = Some(blob.file_id);
                attachment.file_url = Some(blob.url);
                attachment.size = blob.size;
                attachment.status = AttachmentStatus::Complete;
                attachment.updated_at = Utc::now();

                if let Err(e) = record_outcome(self.attachments.as_ref(), &attachment).await {
                    error!(attachment = %attachment.id, "Failed to record completed upload: {}", e);
                }
                pending.finish();

                info!(attachment = %attachment.id, size = attachment.size, "Attachment uploaded");
                self.announce(&attachment, UploadPhase::Complete);
                Ok(attachment)
            }
            Err(e) => {
                attachment.status = AttachmentStatus::Failed;
                attachment.error = Some(e.to_string());
                attachment.updated_at = Utc::now();

                if let Err(update) = record_outcome(self.attachments.as_ref(), &attachment).await {
                    error!(attachment = %attachment.id, "Failed to record failed upload: {}", update);
                }
                pending.finish();

                warn!(attachment = %attachment.id, "Attachment upload failed: {}", e);
                self.announce(&attachment, UploadPhase::Error);
                Err(e)
            }
        }
    }

    async fn store_blob<R>(
        &self,
        attachment: &Attachment,
        reader: &mut R,
        cancel: &CancellationToken,
    ) -> ChatResult<StoredBlob>
    where
        R: AsyncRead + Unpin + Send,
    {
        let max = self.config.max_size;
        let bounded = reader.take(max.saturating_add(1));
        let store = self.blobs.store_file(
            Box::pin(bounded),
            &attachment.storage_name,
            &attachment.content_type,
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Cancelled("upload cancelled".into())),
            result = tokio::time::timeout(self.config.upload_timeout(), store) => match result {
                Ok(Ok(blob)) => Ok(blob),
                Ok(Err(e)) => Err(ChatError::Blob(e.to_string())),
                Err(_) => Err(ChatError::Cancelled("upload timed out".into())),
            },
        };

        let blob = match outcome {
            Ok(blob) => blob,
            Err(e) => {
                // The interrupted write may have left part of the file behind
                if matches!(e, ChatError::Cancelled(_)) {
                    if let Err(delete) = self.blobs.delete_file(&attachment.storage_name).await {
                        warn!(file = %attachment.storage_name, "Failed to delete partial blob: {}", delete);
                    }
                }
                return Err(e);
            }
        };

        if blob.size > max {
            if let Err(e) = self.blobs.delete_file(&blob.file_id).await {
                warn!(file = %blob.file_id, "Failed to delete oversized blob: {}", e);
            }
            return Err(ChatError::AttachmentTooLarge {
                size: blob.size,
                max,
            });
        }
        Ok(blob)
    }

    /// Fetch attachment metadata.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown attachment.
    pub async fn get(&self, attachment_id: Uuid) -> ChatResult<Attachment> {
        self.attachments
            .get_attachment(attachment_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Attachment", attachment_id))
    }

    /// Attachments of a message.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_for_message(&self, message_id: Uuid) -> ChatResult<Vec<Attachment>> {
        Ok(self.attachments.attachments_for_message(message_id).await?)
    }

    /// Delete an attachment. Allowed for the uploader and for channel owners
    /// and admins. The blob is removed best effort.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` or a storage error.
    pub async fn delete(&self, attachment_id: Uuid, requester: Uuid) -> ChatResult<()> {
        let attachment = self.get(attachment_id).await?;

        if attachment.uploader_id != requester {
            let can_moderate = self
                .chat
                .get_member(attachment.channel_id, requester)
                .await?
                .is_some_and(|member| member.role.can_moderate());
            if !can_moderate {
                return Err(ChatError::Unauthorized(format!(
                    "user {} may not delete attachment {}",
                    requester, attachment_id
                )));
            }
        }

        if let Some(file_id) = &attachment.file_id {
            if let Err(e) = self.blobs.delete_file(file_id).await {
                warn!(attachment = %attachment_id, file = %file_id, "Failed to delete blob: {}", e);
            }
        }

        self.attachments.delete_attachment(attachment_id).await?;
        info!(attachment = %attachment_id, requester = %requester, "Attachment deleted");
        self.announce(&attachment, UploadPhase::Deleted);
        Ok(())
    }
}
