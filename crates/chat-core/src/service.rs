//! Request surface of the messaging core.
//!
//! [`ChatService`] wires the store, hub, delivery tracker, attachment
//! pipeline and moderation engine together. Every mutation validates and
//! authorizes first; side effects that follow a successful write are logged
//! rather than surfaced.

use chrono::Utc;
use pulse_chat_protocol::EventKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attachment::{AttachmentConfig, AttachmentPipeline};
use crate::delivery::{DeliveryConfig, DeliveryTracker};
use crate::error::{ChatError, ChatResult};
use crate::events::{MessageDeletedPayload, ReactionPayload};
use crate::hub::{ConnectionHandle, ConnectionId, Hub, HubConfig};
use crate::model::{
    validate_channel_name, Channel, ChannelKind, ChannelMember, DeliveryRecord, MemberRole,
    Message, MessageKind, MessageQuery, Reaction,
};
use crate::moderation::{ModerationConfig, ModerationEngine};
use crate::store::{AttachmentStore, BlobStore, ChatStore, DeliveryStore, ModerationStore};

/// Request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Longest message, in characters.
    pub max_message_length: usize,
    /// Longest reaction, in characters.
    pub max_emoji_length: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4000,
            max_emoji_length: 32,
        }
    }
}

/// Configuration of every core component.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub hub: HubConfig,
    pub service: ServiceConfig,
    pub delivery: DeliveryConfig,
    pub attachments: AttachmentConfig,
    pub moderation: ModerationConfig,
}

/// A message to post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

impl SendMessage {
    #[must_use]
    pub fn new(channel_id: Uuid, author_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            author_id,
            content: content.into(),
            kind: MessageKind::Text,
            parent_id: None,
        }
    }

    #[must_use]
    pub fn reply_to(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }
}

/// The messaging core.
pub struct ChatService {
    chat: Arc<dyn ChatStore>,
    hub: Hub,
    delivery: Arc<DeliveryTracker>,
    attachments: Arc<AttachmentPipeline>,
    moderation: Arc<ModerationEngine>,
    config: ServiceConfig,
}

impl ChatService {
    /// Build every component over one store and load moderation rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the moderation rules cannot be loaded.
    pub async fn open<S>(store: Arc<S>, blobs: Arc<dyn BlobStore>, config: CoreConfig) -> ChatResult<Self>
    where
        S: ChatStore + DeliveryStore + AttachmentStore + ModerationStore + 'static,
    {
        let hub = Hub::with_config(config.hub);
        let delivery = DeliveryTracker::new(store.clone(), store.clone(), hub.clone(), config.delivery);
        let attachments = AttachmentPipeline::new(
            store.clone(),
            store.clone(),
            blobs,
            hub.clone(),
            config.attachments,
        );
        let moderation = ModerationEngine::load(store.clone(), hub.clone(), config.moderation).await?;

        Ok(Self {
            chat: store,
            hub,
            delivery: Arc::new(delivery),
            attachments: Arc::new(attachments),
            moderation: Arc::new(moderation),
            config: config.service,
        })
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub fn delivery(&self) -> &Arc<DeliveryTracker> {
        &self.delivery
    }

    #[must_use]
    pub fn attachments(&self) -> &Arc<AttachmentPipeline> {
        &self.attachments
    }

    #[must_use]
    pub fn moderation(&self) -> &Arc<ModerationEngine> {
        &self.moderation
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn channel(&self, channel_id: Uuid) -> ChatResult<Channel> {
        self.chat
            .get_channel(channel_id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| ChatError::not_found("Channel", channel_id))
    }

    async fn live_message(&self, message_id: Uuid) -> ChatResult<Message> {
        self.chat
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| ChatError::not_found("Message", message_id))
    }

    async fn require_member(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<ChannelMember> {
        self.chat
            .get_member(channel_id, user_id)
            .await?
            .ok_or_else(|| {
                ChatError::Unauthorized(format!(
                    "user {} is not a member of channel {}",
                    user_id, channel_id
                ))
            })
    }

    async fn require_moderator(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<ChannelMember> {
        let member = self.require_member(channel_id, user_id).await?;
        if !member.role.can_moderate() {
            return Err(ChatError::Unauthorized(format!(
                "user {} may not manage channel {}",
                user_id, channel_id
            )));
        }
        Ok(member)
    }

    fn validate_content(&self, content: &str) -> ChatResult<()> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content must not be empty".into()));
        }
        let length = content.chars().count();
        if length > self.config.max_message_length {
            return Err(ChatError::Validation(format!(
                "message is {} characters, the limit is {}",
                length, self.config.max_message_length
            )));
        }
        Ok(())
    }

    // Channels

    /// Create a channel owned by `creator_id`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a bad name or a storage error.
    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        creator_id: Uuid,
    ) -> ChatResult<Channel> {
        validate_channel_name(name).map_err(|e| ChatError::Validation(e.to_string()))?;

        let channel = self
            .chat
            .create_channel(Channel::new(name.trim(), kind, creator_id))
            .await?;
        self.chat
            .add_member(ChannelMember::new(channel.id, creator_id, MemberRole::Owner))
            .await?;
        self.hub.join_user(creator_id, channel.id);

        info!(channel = %channel.id, name = %channel.name, creator = %creator_id, "Created channel");
        Ok(channel)
    }

    /// Add `user_id` to a channel. Owners and admins may add anyone; users
    /// may join public channels themselves.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized`, `Validation` (archived channel or
    /// an `owner` role) or a storage error.
    pub async fn add_member(
        &self,
        channel_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> ChatResult<ChannelMember> {
        let channel = self.channel(channel_id).await?;
        if channel.is_archived {
            return Err(ChatError::Validation("channel is archived".into()));
        }
        if role == MemberRole::Owner {
            return Err(ChatError::Validation("a channel has a single owner".into()));
        }

        if actor_id == user_id {
            if channel.kind != ChannelKind::Public || role != MemberRole::Member {
                return Err(ChatError::Unauthorized(format!(
                    "user {} may not join channel {}",
                    user_id, channel_id
                )));
            }
        } else {
            self.require_moderator(channel_id, actor_id).await?;
        }

        let member = self
            .chat
            .add_member(ChannelMember::new(channel_id, user_id, role))
            .await?;
        self.hub.join_user(user_id, channel_id);

        debug!(channel = %channel_id, user = %user_id, role = ?member.role, "Added member");
        Ok(member)
    }

    /// Remove `user_id` from a channel. Users may leave; owners and admins
    /// may remove others. The creator cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized`, `Validation` or a storage error.
    pub async fn remove_member(&self, channel_id: Uuid, actor_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        let channel = self.channel(channel_id).await?;
        if user_id == channel.creator_id {
            return Err(ChatError::Validation("the channel creator cannot be removed".into()));
        }
        if actor_id != user_id {
            self.require_moderator(channel_id, actor_id).await?;
        }

        let removed = self.chat.remove_member(channel_id, user_id).await?;
        self.hub.leave_user(user_id, channel_id);

        debug!(channel = %channel_id, user = %user_id, removed, "Removed member");
        Ok(removed)
    }

    /// Archive a channel. Archived channels accept no new messages and stop
    /// broadcasting.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` or a storage error.
    pub async fn archive_channel(&self, channel_id: Uuid, actor_id: Uuid) -> ChatResult<Channel> {
        let mut channel = self.channel(channel_id).await?;
        self.require_moderator(channel_id, actor_id).await?;

        if !channel.is_archived {
            channel.is_archived = true;
            channel = self.chat.update_channel(channel).await?;
            info!(channel = %channel_id, actor = %actor_id, "Archived channel");
        }
        self.hub.remove_channel(channel_id);
        Ok(channel)
    }

    /// Channel members.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` for non-members, or a storage
    /// error.
    pub async fn channel_members(&self, channel_id: Uuid, user_id: Uuid) -> ChatResult<Vec<ChannelMember>> {
        self.channel(channel_id).await?;
        self.require_member(channel_id, user_id).await?;
        Ok(self.chat.get_channel_members(channel_id).await?)
    }

    // Connections

    /// Open a hub connection listening on every channel the user belongs to.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or `Validation` if registration is refused.
    pub async fn connect(&self, user_id: Uuid) -> ChatResult<ConnectionHandle> {
        let channels = self.chat.channels_for_user(user_id).await?;
        let handle = self.hub.connect(user_id);

        if let Err(e) = self.hub.register(handle.id(), &channels) {
            self.hub.unregister(handle.id());
            return Err(ChatError::Validation(e.to_string()));
        }

        debug!(connection = %handle.id(), user = %user_id, channels = channels.len(), "User connected");
        Ok(handle)
    }

    /// Close a hub connection.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.hub.unregister(connection_id)
    }

    // Messages

    /// Validate, moderate, persist and broadcast a message.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `NotFound`, `Unauthorized`, `Moderated`, or a
    /// storage error if the message could not be persisted.
    pub async fn send_message(&self, request: SendMessage) -> ChatResult<Message> {
        self.validate_content(&request.content)?;

        let channel = self.channel(request.channel_id).await?;
        if !channel.accepts_messages() {
            return Err(ChatError::Validation("channel is archived".into()));
        }
        self.require_member(channel.id, request.author_id).await?;

        if let Some(parent_id) = request.parent_id {
            let parent = self.live_message(parent_id).await?;
            if parent.channel_id != channel.id {
                return Err(ChatError::Validation(
                    "reply parent belongs to another channel".into(),
                ));
            }
        }

        let warnings = self
            .moderation
            .enforce(channel.id, request.author_id, &request.content)
            .await?
            .into_result()?;
        if !warnings.is_empty() {
            debug!(channel = %channel.id, author = %request.author_id, warnings = warnings.len(), "Message allowed with warnings");
        }

        let message = self
            .chat
            .create_message(Message::new(
                channel.id,
                request.author_id,
                request.content,
                request.kind,
                request.parent_id,
            ))
            .await?;

        if let Err(e) = self.delivery.seed(&message).await {
            warn!(message = %message.id, "Failed to seed delivery records: {}", e);
        }

        self.hub
            .broadcast_to_channel(message.channel_id, EventKind::MessageCreated, &message);
        debug!(message = %message.id, channel = %message.channel_id, "Message sent");
        Ok(message)
    }

    /// Replace a message's content. Only the author may edit.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `NotFound`, `Unauthorized`, `Moderated` or a
    /// storage error.
    pub async fn edit_message(&self, message_id: Uuid, editor_id: Uuid, content: &str) -> ChatResult<Message> {
        self.validate_content(content)?;

        let mut message = self.live_message(message_id).await?;
        if message.author_id != editor_id {
            return Err(ChatError::Unauthorized(format!(
                "user {} may not edit message {}",
                editor_id, message_id
            )));
        }
        let channel = self.channel(message.channel_id).await?;
        if !channel.accepts_messages() {
            return Err(ChatError::Validation("channel is archived".into()));
        }

        self.moderation
            .enforce(channel.id, editor_id, content)
            .await?
            .into_result()?;

        message.content = content.to_string();
        message.is_edited = true;
        message.updated_at = Utc::now();
        let message = self.chat.update_message(message).await?;

        self.hub
            .broadcast_to_channel(message.channel_id, EventKind::MessageUpdated, &message);
        debug!(message = %message.id, "Message edited");
        Ok(message)
    }

    /// Soft-delete a message. Allowed for the author and for channel owners
    /// and admins.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` or a storage error.
    pub async fn delete_message(&self, message_id: Uuid, requester_id: Uuid) -> ChatResult<Message> {
        let message = self.live_message(message_id).await?;
        if message.author_id != requester_id {
            self.require_moderator(message.channel_id, requester_id).await?;
        }

        let message = self.chat.delete_message(message_id).await?;
        self.hub.broadcast_to_channel(
            message.channel_id,
            EventKind::MessageDeleted,
            &MessageDeletedPayload {
                message_id,
                deleted_by: requester_id,
            },
        );
        debug!(message = %message_id, requester = %requester_id, "Message deleted");
        Ok(message)
    }

    /// Channel history for a member, newest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` or a storage error.
    pub async fn get_channel_messages(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        query: &MessageQuery,
    ) -> ChatResult<Vec<Message>> {
        self.channel(channel_id).await?;
        self.require_member(channel_id, user_id).await?;
        if let Some(cursor) = query.before_id {
            let in_channel = self
                .chat
                .get_message(cursor)
                .await?
                .is_some_and(|m| m.channel_id == channel_id);
            if !in_channel {
                return Err(ChatError::not_found("Message", cursor));
            }
        }
        Ok(self.chat.get_channel_messages(channel_id, query).await?)
    }

    /// Mark a message read for a user.
    ///
    /// # Errors
    ///
    /// See [`DeliveryTracker::mark_read`].
    pub async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<DeliveryRecord> {
        self.delivery.mark_read(message_id, user_id).await
    }

    // Reactions

    fn validate_emoji<'a>(&self, emoji: &'a str) -> ChatResult<&'a str> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > self.config.max_emoji_length {
            return Err(ChatError::Validation(format!(
                "reaction must be 1 to {} characters",
                self.config.max_emoji_length
            )));
        }
        Ok(emoji)
    }

    /// React to a message. Reacting twice with the same emoji is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `NotFound`, `Unauthorized` or a storage error.
    pub async fn add_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> ChatResult<Reaction> {
        let emoji = self.validate_emoji(emoji)?;
        let message = self.live_message(message_id).await?;
        self.require_member(message.channel_id, user_id).await?;

        let (reaction, inserted) = self
            .chat
            .add_reaction(Reaction {
                message_id,
                user_id,
                emoji: emoji.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        if inserted {
            self.hub.broadcast_to_channel(
                message.channel_id,
                EventKind::ReactionAdded,
                &ReactionPayload::from(&reaction),
            );
        }
        Ok(reaction)
    }

    /// Withdraw a reaction. Returns whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `NotFound`, `Unauthorized` or a storage error.
    pub async fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> ChatResult<bool> {
        let emoji = self.validate_emoji(emoji)?;
        let message = self.live_message(message_id).await?;
        self.require_member(message.channel_id, user_id).await?;

        let removed = self.chat.remove_reaction(message_id, user_id, emoji).await?;
        if removed {
            self.hub.broadcast_to_channel(
                message.channel_id,
                EventKind::ReactionRemoved,
                &ReactionPayload {
                    message_id,
                    user_id,
                    emoji: emoji.to_string(),
                },
            );
        }
        Ok(removed)
    }

    /// Reactions on a message.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Unauthorized` or a storage error.
    pub async fn reactions(&self, message_id: Uuid, user_id: Uuid) -> ChatResult<Vec<Reaction>> {
        let message = self.live_message(message_id).await?;
        self.require_member(message.channel_id, user_id).await?;
        Ok(self.chat.get_reactions(message_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{ModerationAction, NewRule};
    use crate::store::{FailPoint, InMemoryStore, MemoryBlobStore};
    use pulse_chat_protocol::Event;
    use std::time::Duration;

    async fn service() -> (ChatService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let service = ChatService::open(store.clone(), Arc::new(MemoryBlobStore::new()), CoreConfig::default())
            .await
            .unwrap();
        (service, store)
    }

    async fn next_event(handle: &mut ConnectionHandle) -> Event {
        tokio::time::timeout(Duration::from_secs(5), handle.recv_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_channel_makes_creator_owner() {
        let (service, _) = service().await;
        let creator = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, creator)
            .await
            .unwrap();

        let members = service.channel_members(channel.id, creator).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, MemberRole::Owner);

        assert!(matches!(
            service.create_channel("  ", ChannelKind::Public, creator).await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_membership_rules() {
        let (service, _) = service().await;
        let owner = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let channel = service
            .create_channel("team", ChannelKind::Private, owner)
            .await
            .unwrap();

        // Private channels cannot be joined without an invite
        assert!(matches!(
            service.add_member(channel.id, alice, alice, MemberRole::Member).await,
            Err(ChatError::Unauthorized(_))
        ));
        service
            .add_member(channel.id, owner, alice, MemberRole::Member)
            .await
            .unwrap();
        // Re-adding is idempotent
        service
            .add_member(channel.id, owner, alice, MemberRole::Member)
            .await
            .unwrap();

        // Plain members cannot add or remove others
        assert!(matches!(
            service.add_member(channel.id, alice, bob, MemberRole::Member).await,
            Err(ChatError::Unauthorized(_))
        ));
        assert!(matches!(
            service.remove_member(channel.id, alice, owner).await,
            Err(ChatError::Validation(_))
        ));

        // Leaving is always allowed
        assert!(service.remove_member(channel.id, alice, alice).await.unwrap());
        assert_eq!(service.channel_members(channel.id, owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let (service, store) = service().await;
        let owner = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();

        let cases = [
            SendMessage::new(channel.id, owner, "   "),
            SendMessage::new(channel.id, owner, "x".repeat(4001)),
        ];
        for request in cases {
            assert!(matches!(
                service.send_message(request).await,
                Err(ChatError::Validation(_))
            ));
        }
        assert!(matches!(
            service.send_message(SendMessage::new(channel.id, outsider, "hi")).await,
            Err(ChatError::Unauthorized(_))
        ));
        assert!(matches!(
            service.send_message(SendMessage::new(Uuid::new_v4(), owner, "hi")).await,
            Err(ChatError::NotFound(_))
        ));

        let other = service
            .create_channel("other", ChannelKind::Public, owner)
            .await
            .unwrap();
        let elsewhere = service
            .send_message(SendMessage::new(other.id, owner, "over here"))
            .await
            .unwrap();
        assert!(matches!(
            service
                .send_message(SendMessage::new(channel.id, owner, "reply").reply_to(elsewhere.id))
                .await,
            Err(ChatError::Validation(_))
        ));

        service.archive_channel(channel.id, owner).await.unwrap();
        assert!(matches!(
            service.send_message(SendMessage::new(channel.id, owner, "late")).await,
            Err(ChatError::Validation(_))
        ));
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_moderated_message_is_not_persisted() {
        let (service, store) = service().await;
        let owner = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();
        service
            .moderation()
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Delete))
            .await
            .unwrap();

        let result = service
            .send_message(SendMessage::new(channel.id, owner, "this is spam content"))
            .await;
        assert!(matches!(result, Err(ChatError::Moderated { rule_id: Some(_), .. })));
        assert_eq!(store.message_count(), 0);

        service
            .send_message(SendMessage::new(channel.id, owner, "spammer's delight"))
            .await
            .unwrap();
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_surfaces() {
        let (service, store) = service().await;
        let owner = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();

        store.fail_next(FailPoint::CreateMessage, 1);
        assert!(matches!(
            service.send_message(SendMessage::new(channel.id, owner, "hi")).await,
            Err(ChatError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_failure_is_logged_only() {
        let (service, store) = service().await;
        let owner = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();

        store.fail_next(FailPoint::AdvanceDelivery, 1);
        let message = service
            .send_message(SendMessage::new(channel.id, owner, "hi"))
            .await
            .unwrap();
        assert!(service.delivery().status(message.id, owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_and_delete() {
        let (service, _) = service().await;
        let owner = Uuid::new_v4();
        let author = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();
        service
            .add_member(channel.id, author, author, MemberRole::Member)
            .await
            .unwrap();
        let message = service
            .send_message(SendMessage::new(channel.id, author, "helo"))
            .await
            .unwrap();

        assert!(matches!(
            service.edit_message(message.id, owner, "hijack").await,
            Err(ChatError::Unauthorized(_))
        ));
        let edited = service.edit_message(message.id, author, "hello").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "hello");

        // Owners may delete anyone's message
        let deleted = service.delete_message(message.id, owner).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(matches!(
            service.delete_message(message.id, author).await,
            Err(ChatError::NotFound(_))
        ));

        let history = service
            .get_channel_messages(channel.id, author, &MessageQuery::default())
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_history_cursor_must_be_in_channel() {
        let (service, _) = service().await;
        let owner = Uuid::new_v4();
        let general = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();
        let random = service
            .create_channel("random", ChannelKind::Public, owner)
            .await
            .unwrap();
        let first = service
            .send_message(SendMessage::new(general.id, owner, "one"))
            .await
            .unwrap();
        let second = service
            .send_message(SendMessage::new(general.id, owner, "two"))
            .await
            .unwrap();
        let elsewhere = service
            .send_message(SendMessage::new(random.id, owner, "three"))
            .await
            .unwrap();

        let older = service
            .get_channel_messages(
                general.id,
                owner,
                &MessageQuery {
                    before_id: Some(second.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first.id]);

        for cursor in [elsewhere.id, Uuid::new_v4()] {
            let result = service
                .get_channel_messages(
                    general.id,
                    owner,
                    &MessageQuery {
                        before_id: Some(cursor),
                        ..Default::default()
                    },
                )
                .await;
            assert!(matches!(result, Err(ChatError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_reactions_are_idempotent() {
        let (service, _) = service().await;
        let owner = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();
        let message = service
            .send_message(SendMessage::new(channel.id, owner, "party"))
            .await
            .unwrap();
        let mut handle = service.connect(owner).await.unwrap();

        service.add_reaction(message.id, owner, "🎉").await.unwrap();
        service.add_reaction(message.id, owner, "🎉").await.unwrap();
        assert_eq!(service.reactions(message.id, owner).await.unwrap().len(), 1);

        assert!(service.remove_reaction(message.id, owner, "🎉").await.unwrap());
        assert!(!service.remove_reaction(message.id, owner, "🎉").await.unwrap());

        assert_eq!(next_event(&mut handle).await.kind, EventKind::ReactionAdded);
        assert_eq!(next_event(&mut handle).await.kind, EventKind::ReactionRemoved);
        assert!(handle.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_follows_membership() {
        let (service, _) = service().await;
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let channel = service
            .create_channel("general", ChannelKind::Public, owner)
            .await
            .unwrap();

        let mut handle = service.connect(guest).await.unwrap();
        assert!(service.hub().connection_channels(handle.id()).is_empty());

        // Joining registers live connections
        service
            .add_member(channel.id, guest, guest, MemberRole::Member)
            .await
            .unwrap();
        service
            .send_message(SendMessage::new(channel.id, owner, "welcome"))
            .await
            .unwrap();
        assert_eq!(next_event(&mut handle).await.kind, EventKind::MessageCreated);

        assert!(service.disconnect(handle.id()));
        assert!(handle.recv().await.is_none());
    }
}
