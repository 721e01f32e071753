//! In-memory implementation of every record store.
//!
//! All tables live behind one `RwLock` so cross-table reads (unread counts,
//! orphan scans) see a consistent view. Failure points can be armed to
//! exercise degraded paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{
    AttachmentStore, ChatStore, DeliveryStore, ModerationStore, StoreError, StoreResult,
};
use crate::model::{
    Attachment, Channel, ChannelMember, DeliveryRecord, DeliveryStatus, DeliveryUpdate, Message,
    MessageQuery, Reaction,
};
use crate::moderation::{ModerationRule, ModerationViolation, Restriction};

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateMessage,
    AdvanceDelivery,
    CreateAttachment,
    UpdateAttachment,
    RecordViolation,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<Uuid, Channel>,
    members: HashMap<(Uuid, Uuid), ChannelMember>,
    messages: HashMap<Uuid, Message>,
    /// Insertion order of `messages`, oldest first.
    message_order: Vec<Uuid>,
    reactions: Vec<Reaction>,
    deliveries: HashMap<(Uuid, Uuid), DeliveryRecord>,
    attachments: HashMap<Uuid, Attachment>,
    rules: Vec<ModerationRule>,
    violations: Vec<ModerationViolation>,
    restrictions: Vec<Restriction>,
}

/// Lock-guarded tables implementing [`ChatStore`], [`DeliveryStore`],
/// [`AttachmentStore`] and [`ModerationStore`].
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    failures: Mutex<HashMap<FailPoint, usize>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls at `point` fail with a backend error.
    pub fn fail_next(&self, point: FailPoint, count: usize) {
        self.failures.lock().insert(point, count);
    }

    fn check(&self, point: FailPoint) -> StoreResult<()> {
        let mut failures = self.failures.lock();
        match failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Backend(format!("injected failure at {:?}", point)))
            }
            _ => Ok(()),
        }
    }

    /// Number of message rows, including soft-deleted ones.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }

    /// Number of attachment rows.
    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.tables.read().attachments.len()
    }

    /// Number of delivery records.
    #[must_use]
    pub fn delivery_count(&self) -> usize {
        self.tables.read().deliveries.len()
    }

    /// Number of recorded violations.
    #[must_use]
    pub fn violation_count(&self) -> usize {
        self.tables.read().violations.len()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_channel(&self, channel: Channel) -> StoreResult<Channel> {
        let mut tables = self.tables.write();
        if tables.channels.contains_key(&channel.id) {
            return Err(StoreError::Conflict(format!("channel {}", channel.id)));
        }
        tables.channels.insert(channel.id, channel.clone());
        Ok(channel)
    }

    async fn get_channel(&self, channel_id: Uuid) -> StoreResult<Option<Channel>> {
        Ok(self.tables.read().channels.get(&channel_id).cloned())
    }

    async fn update_channel(&self, channel: Channel) -> StoreResult<Channel> {
        let mut tables = self.tables.write();
        match tables.channels.get_mut(&channel.id) {
            Some(stored) => {
                *stored = channel.clone();
                Ok(channel)
            }
            None => Err(StoreError::NotFound(format!("channel {}", channel.id))),
        }
    }

    async fn add_member(&self, member: ChannelMember) -> StoreResult<ChannelMember> {
        let mut tables = self.tables.write();
        if !tables.channels.contains_key(&member.channel_id) {
            return Err(StoreError::NotFound(format!("channel {}", member.channel_id)));
        }
        let stored = tables
            .members
            .entry((member.channel_id, member.user_id))
            .or_insert(member);
        Ok(stored.clone())
    }

    async fn remove_member(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .members
            .remove(&(channel_id, user_id))
            .is_some())
    }

    async fn get_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<ChannelMember>> {
        Ok(self
            .tables
            .read()
            .members
            .get(&(channel_id, user_id))
            .cloned())
    }

    async fn get_channel_members(&self, channel_id: Uuid) -> StoreResult<Vec<ChannelMember>> {
        let tables = self.tables.read();
        let mut members: Vec<ChannelMember> = tables
            .members
            .values()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        Ok(members)
    }

    async fn channels_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.read();
        Ok(tables
            .members
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .map(|(cid, _)| *cid)
            .filter(|cid| {
                tables
                    .channels
                    .get(cid)
                    .map_or(false, |c| !c.is_deleted())
            })
            .collect())
    }

    async fn create_message(&self, message: Message) -> StoreResult<Message> {
        self.check(FailPoint::CreateMessage)?;
        let mut tables = self.tables.write();
        if tables.messages.contains_key(&message.id) {
            return Err(StoreError::Conflict(format!("message {}", message.id)));
        }
        tables.message_order.push(message.id);
        tables.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self.tables.read().messages.get(&message_id).cloned())
    }

    async fn update_message(&self, message: Message) -> StoreResult<Message> {
        let mut tables = self.tables.write();
        match tables.messages.get_mut(&message.id) {
            Some(stored) => {
                *stored = message.clone();
                Ok(message)
            }
            None => Err(StoreError::NotFound(format!("message {}", message.id))),
        }
    }

    async fn delete_message(&self, message_id: Uuid) -> StoreResult<Message> {
        let mut tables = self.tables.write();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;
        if !message.is_deleted {
            let now = Utc::now();
            message.is_deleted = true;
            message.deleted_at = Some(now);
            message.updated_at = now;
        }
        Ok(message.clone())
    }

    async fn purge_deleted_messages(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut tables = self.tables.write();
        let purged: HashSet<Uuid> = tables
            .messages
            .values()
            .filter(|m| m.deleted_at.map_or(false, |at| at < cutoff))
            .map(|m| m.id)
            .collect();

        if purged.is_empty() {
            return Ok(0);
        }

        tables.messages.retain(|id, _| !purged.contains(id));
        tables.message_order.retain(|id| !purged.contains(id));
        tables.reactions.retain(|r| !purged.contains(&r.message_id));
        Ok(purged.len())
    }

    async fn get_channel_messages(
        &self,
        channel_id: Uuid,
        query: &MessageQuery,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read();
        let older = match query.before_id {
            Some(cursor) => match tables.message_order.iter().position(|id| *id == cursor) {
                Some(index) => &tables.message_order[..index],
                None => return Err(StoreError::NotFound(format!("message {}", cursor))),
            },
            None => &tables.message_order[..],
        };
        Ok(older
            .iter()
            .rev()
            .filter_map(|id| tables.messages.get(id))
            .filter(|m| m.channel_id == channel_id)
            .filter(|m| query.include_deleted || !m.is_deleted)
            .filter(|m| query.before.map_or(true, |before| m.created_at < before))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn add_reaction(&self, reaction: Reaction) -> StoreResult<(Reaction, bool)> {
        let mut tables = self.tables.write();
        if !tables.messages.contains_key(&reaction.message_id) {
            return Err(StoreError::NotFound(format!("message {}", reaction.message_id)));
        }
        if let Some(existing) = tables.reactions.iter().find(|r| {
            r.message_id == reaction.message_id
                && r.user_id == reaction.user_id
                && r.emoji == reaction.emoji
        }) {
            return Ok((existing.clone(), false));
        }
        tables.reactions.push(reaction.clone());
        Ok((reaction, true))
    }

    async fn remove_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let before = tables.reactions.len();
        tables
            .reactions
            .retain(|r| !(r.message_id == message_id && r.user_id == user_id && r.emoji == emoji));
        Ok(tables.reactions.len() != before)
    }

    async fn get_reactions(&self, message_id: Uuid) -> StoreResult<Vec<Reaction>> {
        Ok(self
            .tables
            .read()
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn advance_delivery(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        status: DeliveryStatus,
    ) -> StoreResult<DeliveryUpdate> {
        self.check(FailPoint::AdvanceDelivery)?;
        let mut tables = self.tables.write();
        let now = Utc::now();

        match tables.deliveries.get_mut(&(message_id, user_id)) {
            Some(record) if record.status >= status => Ok(DeliveryUpdate {
                record: record.clone(),
                advanced: false,
            }),
            Some(record) => {
                record.status = status;
                record.updated_at = record.updated_at.max(now);
                Ok(DeliveryUpdate {
                    record: record.clone(),
                    advanced: true,
                })
            }
            None => {
                let record = DeliveryRecord {
                    message_id,
                    user_id,
                    status,
                    updated_at: now,
                };
                tables
                    .deliveries
                    .insert((message_id, user_id), record.clone());
                Ok(DeliveryUpdate {
                    record,
                    advanced: true,
                })
            }
        }
    }

    async fn get_delivery(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<DeliveryRecord>> {
        Ok(self
            .tables
            .read()
            .deliveries
            .get(&(message_id, user_id))
            .cloned())
    }

    async fn count_unread(&self, channel_id: Uuid, user_id: Uuid) -> StoreResult<usize> {
        let tables = self.tables.read();
        Ok(tables
            .messages
            .values()
            .filter(|m| m.channel_id == channel_id && !m.is_deleted)
            .filter(|m| {
                tables
                    .deliveries
                    .get(&(m.id, user_id))
                    .map_or(true, |r| r.status < DeliveryStatus::Read)
            })
            .count())
    }

    async fn orphaned_delivery_messages(&self, limit: usize) -> StoreResult<Vec<Uuid>> {
        let tables = self.tables.read();
        let mut seen = HashSet::new();
        Ok(tables
            .deliveries
            .keys()
            .map(|(mid, _)| *mid)
            .filter(|mid| !tables.messages.contains_key(mid))
            .filter(|mid| seen.insert(*mid))
            .take(limit)
            .collect())
    }

    async fn delete_deliveries_for(&self, message_ids: &[Uuid]) -> StoreResult<usize> {
        let targets: HashSet<&Uuid> = message_ids.iter().collect();
        let mut tables = self.tables.write();
        let before = tables.deliveries.len();
        tables
            .deliveries
            .retain(|(mid, _), _| !targets.contains(mid));
        Ok(before - tables.deliveries.len())
    }
}

#[async_trait]
impl AttachmentStore for InMemoryStore {
    async fn create_attachment(&self, attachment: Attachment) -> StoreResult<Attachment> {
        self.check(FailPoint::CreateAttachment)?;
        let mut tables = self.tables.write();
        if tables.attachments.contains_key(&attachment.id) {
            return Err(StoreError::Conflict(format!("attachment {}", attachment.id)));
        }
        tables.attachments.insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn get_attachment(&self, attachment_id: Uuid) -> StoreResult<Option<Attachment>> {
        Ok(self.tables.read().attachments.get(&attachment_id).cloned())
    }

    async fn update_attachment(&self, attachment: Attachment) -> StoreResult<Attachment> {
        self.check(FailPoint::UpdateAttachment)?;
        let mut tables = self.tables.write();
        match tables.attachments.get_mut(&attachment.id) {
            Some(stored) => {
                *stored = attachment.clone();
                Ok(attachment)
            }
            None => Err(StoreError::NotFound(format!("attachment {}", attachment.id))),
        }
    }

    async fn delete_attachment(&self, attachment_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .tables
            .write()
            .attachments
            .remove(&attachment_id)
            .is_some())
    }

    async fn attachments_for_message(&self, message_id: Uuid) -> StoreResult<Vec<Attachment>> {
        let tables = self.tables.read();
        let mut attachments: Vec<Attachment> = tables
            .attachments
            .values()
            .filter(|a| a.message_id == message_id)
            .cloned()
            .collect();
        attachments.sort_by_key(|a| a.uploaded_at);
        Ok(attachments)
    }
}

#[async_trait]
impl ModerationStore for InMemoryStore {
    async fn list_rules(&self) -> StoreResult<Vec<ModerationRule>> {
        Ok(self.tables.read().rules.clone())
    }

    async fn create_rule(&self, rule: ModerationRule) -> StoreResult<ModerationRule> {
        let mut tables = self.tables.write();
        if tables.rules.iter().any(|r| r.id == rule.id) {
            return Err(StoreError::Conflict(format!("rule {}", rule.id)));
        }
        tables.rules.push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: ModerationRule) -> StoreResult<ModerationRule> {
        let mut tables = self.tables.write();
        match tables.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(stored) => {
                *stored = rule.clone();
                Ok(rule)
            }
            None => Err(StoreError::NotFound(format!("rule {}", rule.id))),
        }
    }

    async fn delete_rule(&self, rule_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let before = tables.rules.len();
        tables.rules.retain(|r| r.id != rule_id);
        Ok(tables.rules.len() != before)
    }

    async fn record_violation(&self, violation: ModerationViolation) -> StoreResult<()> {
        self.check(FailPoint::RecordViolation)?;
        self.tables.write().violations.push(violation);
        Ok(())
    }

    async fn violations_for_user(&self, user_id: Uuid) -> StoreResult<Vec<ModerationViolation>> {
        Ok(self
            .tables
            .read()
            .violations
            .iter()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_restriction(&self, restriction: Restriction) -> StoreResult<Restriction> {
        let mut tables = self.tables.write();
        let existing = tables.restrictions.iter_mut().find(|r| {
            r.user_id == restriction.user_id
                && r.channel_id == restriction.channel_id
                && r.kind == restriction.kind
        });

        match existing {
            Some(stored) => {
                if restriction.expires_at > stored.expires_at {
                    stored.expires_at = restriction.expires_at;
                    stored.rule_id = restriction.rule_id;
                }
                Ok(stored.clone())
            }
            None => {
                tables.restrictions.push(restriction.clone());
                Ok(restriction)
            }
        }
    }

    async fn active_restrictions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Restriction>> {
        Ok(self
            .tables
            .read()
            .restrictions
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active(now))
            .cloned()
            .collect())
    }
}
