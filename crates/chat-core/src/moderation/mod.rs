//! Content moderation.
//!
//! Rules are literal patterns mapped to actions. The engine keeps a compiled
//! snapshot of every rule behind a lock that is only written when the rule
//! set changes, so checking a message never waits on the store.

mod matcher;
mod rule;

pub use matcher::{compile, MatchMode};
pub use rule::{
    ModerationAction, ModerationRule, ModerationViolation, NewRule, Restriction, RestrictionKind,
    RuleUpdate, Severity,
};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use pulse_chat_protocol::EventKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::events::ModerationViolationPayload;
use crate::hub::Hub;
use crate::store::ModerationStore;
use matcher::RuleSet;

/// Restrictions longer than this are clamped.
const MAX_RESTRICTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Moderation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub match_mode: MatchMode,
    /// Mute length when a rule does not set one.
    pub default_mute_secs: u64,
    /// Ban length when a rule does not set one.
    pub default_ban_secs: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            match_mode: MatchMode::Boundary,
            default_mute_secs: 60 * 60,
            default_ban_secs: 24 * 60 * 60,
        }
    }
}

impl ModerationConfig {
    fn default_duration(&self, action: ModerationAction) -> Option<u64> {
        match action {
            ModerationAction::Mute => Some(self.default_mute_secs),
            ModerationAction::Ban => Some(self.default_ban_secs),
            ModerationAction::Warn | ModerationAction::Delete => None,
        }
    }
}

/// Result of checking content against the rule set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    /// Matched rules, highest severity first.
    pub matched: Vec<ModerationRule>,
}

impl Verdict {
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        !self.matched.is_empty()
    }

    /// The most severe rule that stops the message, if any.
    #[must_use]
    pub fn rejecting_rule(&self) -> Option<&ModerationRule> {
        self.matched.iter().find(|rule| rule.action.rejects_message())
    }
}

/// Outcome of enforcing the rules on an author's content.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The message may proceed. `warnings` lists matched `warn` rules.
    Allow { warnings: Vec<ModerationRule> },
    /// The message must not be persisted.
    Reject {
        rule: ModerationRule,
        restrictions: Vec<Restriction>,
    },
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Turn a rejection into [`ChatError::Moderated`].
    ///
    /// # Errors
    ///
    /// Returns `Moderated` carrying the deciding rule.
    pub fn into_result(self) -> ChatResult<Vec<ModerationRule>> {
        match self {
            Decision::Allow { warnings } => Ok(warnings),
            Decision::Reject { rule, .. } => Err(ChatError::Moderated {
                rule_id: Some(rule.id),
                reason: rule.description,
            }),
        }
    }
}

/// Evaluates content against moderation rules and applies their actions.
pub struct ModerationEngine {
    store: Arc<dyn ModerationStore>,
    hub: Hub,
    config: ModerationConfig,
    rules: RwLock<Arc<RuleSet>>,
    writes: tokio::sync::Mutex<()>,
}

impl ModerationEngine {
    /// Create an engine with an empty rule snapshot. Call
    /// [`reload`](Self::reload) to pick up stored rules.
    #[must_use]
    pub fn new(store: Arc<dyn ModerationStore>, hub: Hub, config: ModerationConfig) -> Self {
        let rules = RuleSet::new(config.match_mode, Vec::new());
        Self {
            store,
            hub,
            config,
            rules: RwLock::new(Arc::new(rules)),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Create an engine and load stored rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules cannot be listed.
    pub async fn load(
        store: Arc<dyn ModerationStore>,
        hub: Hub,
        config: ModerationConfig,
    ) -> ChatResult<Self> {
        let engine = Self::new(store, hub, config);
        engine.reload().await?;
        Ok(engine)
    }

    #[must_use]
    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&*self.rules.read())
    }

    fn replace_rules(&self, rules: Vec<ModerationRule>) {
        let set = RuleSet::new(self.config.match_mode, rules);
        debug!(rules = set.len(), mode = ?set.mode(), "Rule snapshot replaced");
        *self.rules.write() = Arc::new(set);
    }

    /// Rebuild the snapshot from the store. Returns the number of rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules cannot be listed; the previous snapshot
    /// stays in place.
    pub async fn reload(&self) -> ChatResult<usize> {
        let _guard = self.writes.lock().await;
        let rules = self.store.list_rules().await?;
        let count = rules.len();
        self.replace_rules(rules);
        info!(rules = count, "Loaded moderation rules");
        Ok(count)
    }

    /// Every rule, active or not.
    #[must_use]
    pub fn list_rules(&self) -> Vec<ModerationRule> {
        self.snapshot().rules()
    }

    /// Check content without side effects.
    #[must_use]
    pub fn check_message(&self, channel_id: Uuid, content: &str) -> Verdict {
        Verdict {
            matched: self.snapshot().matches(channel_id, content),
        }
    }

    /// The author's active restriction covering `channel_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if restrictions cannot be read.
    pub async fn active_restriction(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> ChatResult<Option<Restriction>> {
        let now = Utc::now();
        let restrictions = self.store.active_restrictions(user_id, now).await?;
        Ok(restrictions
            .into_iter()
            .find(|r| r.is_active(now) && r.covers(channel_id)))
    }

    /// Check the author and content, and apply every matched rule.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthorized`] if the author is muted or banned
    /// in the channel, or a storage error if restrictions cannot be read.
    pub async fn enforce(
        &self,
        channel_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> ChatResult<Decision> {
        if let Some(restriction) = self.active_restriction(author_id, channel_id).await? {
            debug!(user = %author_id, channel = %channel_id, kind = ?restriction.kind, "Restricted author");
            return Err(ChatError::Unauthorized(format!(
                "user is {} until {}",
                match restriction.kind {
                    RestrictionKind::Mute => "muted",
                    RestrictionKind::Ban => "banned",
                },
                restriction.expires_at.to_rfc3339()
            )));
        }

        let verdict = self.check_message(channel_id, content);
        if !verdict.is_flagged() {
            return Ok(Decision::Allow { warnings: Vec::new() });
        }

        let mut restrictions = Vec::new();
        for rule in &verdict.matched {
            warn!(
                rule = %rule.id,
                user = %author_id,
                channel = %channel_id,
                action = ?rule.action,
                "Moderation rule matched"
            );

            self.record_violation(ModerationViolation {
                id: Uuid::new_v4(),
                rule_id: rule.id,
                message_id: None,
                channel_id,
                user_id: author_id,
                action: rule.action,
                pattern: rule.pattern.clone(),
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await;

            if let Some(restriction) = self.restrict(rule, author_id).await {
                restrictions.push(restriction);
            }

            self.hub.broadcast_to_channel(
                channel_id,
                EventKind::ModerationViolation,
                &ModerationViolationPayload::new(rule, author_id),
            );
        }

        Ok(match verdict.rejecting_rule() {
            Some(rule) => Decision::Reject {
                rule: rule.clone(),
                restrictions,
            },
            None => Decision::Allow {
                warnings: verdict.matched,
            },
        })
    }

    /// Audit records are best effort: one retry, then an error log.
    async fn record_violation(&self, violation: ModerationViolation) {
        if let Err(first) = self.store.record_violation(violation.clone()).await {
            warn!(rule = %violation.rule_id, "Recording violation failed, retrying: {}", first);
            if let Err(e) = self.store.record_violation(violation.clone()).await {
                error!(
                    rule = %violation.rule_id,
                    user = %violation.user_id,
                    channel = %violation.channel_id,
                    "Dropped moderation audit record: {}",
                    e
                );
            }
        }
    }

    async fn restrict(&self, rule: &ModerationRule, user_id: Uuid) -> Option<Restriction> {
        let kind = rule.action.restriction()?;
        let secs = rule
            .duration_secs
            .or_else(|| self.config.default_duration(rule.action))?;
        let duration = Duration::seconds(i64::try_from(secs.min(MAX_RESTRICTION_SECS)).unwrap_or(0));

        let restriction = Restriction {
            user_id,
            channel_id: rule.channel_id,
            kind,
            rule_id: Some(rule.id),
            expires_at: Utc::now() + duration,
        };
        match self.store.upsert_restriction(restriction).await {
            Ok(stored) => {
                info!(user = %user_id, kind = ?kind, until = %stored.expires_at, "Restriction applied");
                Some(stored)
            }
            Err(e) => {
                warn!(user = %user_id, rule = %rule.id, "Failed to apply restriction: {}", e);
                None
            }
        }
    }

    fn validate(&self, rule: &mut ModerationRule) -> ChatResult<()> {
        rule.pattern = rule.pattern.trim().to_string();
        rule.description = rule.description.trim().to_string();
        if rule.pattern.is_empty() {
            return Err(ChatError::Validation("rule pattern must not be empty".into()));
        }
        if rule.description.is_empty() {
            return Err(ChatError::Validation("rule description must not be empty".into()));
        }
        if rule.action.is_time_boxed() {
            let secs = rule
                .duration_secs
                .or_else(|| self.config.default_duration(rule.action));
            match secs {
                Some(secs) if secs > 0 => rule.duration_secs = Some(secs),
                _ => {
                    return Err(ChatError::Validation(
                        "mute and ban durations must be positive".into(),
                    ))
                }
            }
        } else {
            rule.duration_secs = None;
        }
        compile(&rule.pattern, self.config.match_mode)
            .map_err(|e| ChatError::Validation(format!("rule pattern rejected: {}", e)))?;
        Ok(())
    }

    /// Create a rule.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty pattern or description or a zero
    /// duration, or a storage error.
    pub async fn create_rule(&self, new: NewRule) -> ChatResult<ModerationRule> {
        let now = Utc::now();
        let mut rule = ModerationRule {
            id: Uuid::new_v4(),
            pattern: new.pattern,
            description: new.description,
            action: new.action,
            severity: new.severity,
            duration_secs: new.duration_secs,
            is_active: new.is_active,
            channel_id: new.channel_id,
            created_at: now,
            updated_at: now,
        };
        self.validate(&mut rule)?;

        let _guard = self.writes.lock().await;
        let rule = self.store.create_rule(rule).await?;
        let mut rules = self.snapshot().rules();
        rules.push(rule.clone());
        self.replace_rules(rules);

        info!(rule = %rule.id, action = ?rule.action, "Created moderation rule");
        Ok(rule)
    }

    /// Apply a partial update to a rule.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown rule, `Validation` as for
    /// [`create_rule`](Self::create_rule), or a storage error.
    pub async fn update_rule(&self, rule_id: Uuid, update: RuleUpdate) -> ChatResult<ModerationRule> {
        let _guard = self.writes.lock().await;
        let snapshot = self.snapshot();
        let mut rule = snapshot
            .get(rule_id)
            .cloned()
            .ok_or_else(|| ChatError::not_found("Rule", rule_id))?;

        if let Some(pattern) = update.pattern {
            rule.pattern = pattern;
        }
        if let Some(description) = update.description {
            rule.description = description;
        }
        if let Some(action) = update.action {
            rule.action = action;
        }
        if let Some(severity) = update.severity {
            rule.severity = severity;
        }
        if let Some(secs) = update.duration_secs {
            rule.duration_secs = Some(secs);
        }
        if let Some(active) = update.is_active {
            rule.is_active = active;
        }
        rule.updated_at = Utc::now();
        self.validate(&mut rule)?;

        let rule = self.store.update_rule(rule).await?;
        let rules = snapshot
            .rules()
            .into_iter()
            .map(|r| if r.id == rule_id { rule.clone() } else { r })
            .collect();
        self.replace_rules(rules);

        info!(rule = %rule.id, "Updated moderation rule");
        Ok(rule)
    }

    /// Delete a rule.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown rule or a storage error.
    pub async fn delete_rule(&self, rule_id: Uuid) -> ChatResult<()> {
        let _guard = self.writes.lock().await;
        if !self.store.delete_rule(rule_id).await? {
            return Err(ChatError::not_found("Rule", rule_id));
        }
        let rules = self
            .snapshot()
            .rules()
            .into_iter()
            .filter(|r| r.id != rule_id)
            .collect();
        self.replace_rules(rules);

        info!(rule = %rule_id, "Deleted moderation rule");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailPoint, InMemoryStore};

    fn engine_with(store: Arc<InMemoryStore>) -> ModerationEngine {
        ModerationEngine::new(store, Hub::new(), ModerationConfig::default())
    }

    #[tokio::test]
    async fn test_check_message_boundary() {
        let engine = engine_with(Arc::new(InMemoryStore::new()));
        engine
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Delete))
            .await
            .unwrap();

        let channel = Uuid::new_v4();
        assert!(engine.check_message(channel, "this is spam content").is_flagged());
        assert!(!engine.check_message(channel, "spammer's delight").is_flagged());
    }

    #[tokio::test]
    async fn test_matches_ordered_by_severity() {
        let engine = engine_with(Arc::new(InMemoryStore::new()));
        engine
            .create_rule(NewRule::new("buy", "ads", ModerationAction::Warn).with_severity(Severity::Low))
            .await
            .unwrap();
        engine
            .create_rule(
                NewRule::new("scam", "fraud", ModerationAction::Delete)
                    .with_severity(Severity::Critical),
            )
            .await
            .unwrap();

        let verdict = engine.check_message(Uuid::new_v4(), "buy this scam");
        assert_eq!(verdict.matched.len(), 2);
        assert_eq!(verdict.matched[0].severity, Severity::Critical);
        assert_eq!(verdict.rejecting_rule().unwrap().pattern, "scam");
    }

    #[tokio::test]
    async fn test_channel_scoped_rules() {
        let engine = engine_with(Arc::new(InMemoryStore::new()));
        let general = Uuid::new_v4();
        engine
            .create_rule(NewRule::new("offtopic", "stay on topic", ModerationAction::Warn).in_channel(general))
            .await
            .unwrap();

        assert!(engine.check_message(general, "offtopic chatter").is_flagged());
        assert!(!engine.check_message(Uuid::new_v4(), "offtopic chatter").is_flagged());
    }

    #[tokio::test]
    async fn test_rule_validation() {
        let engine = engine_with(Arc::new(InMemoryStore::new()));

        let empty = engine
            .create_rule(NewRule::new("  ", "blank", ModerationAction::Warn))
            .await;
        assert!(matches!(empty, Err(ChatError::Validation(_))));

        let no_description = engine
            .create_rule(NewRule::new("spam", "", ModerationAction::Warn))
            .await;
        assert!(matches!(no_description, Err(ChatError::Validation(_))));

        let zero = engine
            .create_rule(NewRule::new("spam", "x", ModerationAction::Mute).with_duration_secs(0))
            .await;
        assert!(matches!(zero, Err(ChatError::Validation(_))));

        let defaulted = engine
            .create_rule(NewRule::new("spam", "x", ModerationAction::Ban))
            .await
            .unwrap();
        assert_eq!(defaulted.duration_secs, Some(24 * 60 * 60));
    }

    #[tokio::test]
    async fn test_enforce_warn_allows() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(Arc::clone(&store));
        engine
            .create_rule(NewRule::new("heck", "language", ModerationAction::Warn))
            .await
            .unwrap();

        let decision = engine
            .enforce(Uuid::new_v4(), Uuid::new_v4(), "oh heck")
            .await
            .unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.into_result().unwrap().len(), 1);
        assert_eq!(store.violation_count(), 1);
    }

    #[tokio::test]
    async fn test_enforce_mute_rejects_and_restricts() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(Arc::clone(&store));
        engine
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Mute).with_duration_secs(600))
            .await
            .unwrap();

        let channel = Uuid::new_v4();
        let author = Uuid::new_v4();
        let decision = engine.enforce(channel, author, "spam spam").await.unwrap();
        match &decision {
            Decision::Reject { restrictions, .. } => {
                assert_eq!(restrictions.len(), 1);
                assert_eq!(restrictions[0].kind, RestrictionKind::Mute);
            }
            Decision::Allow { .. } => panic!("expected rejection"),
        }
        assert!(matches!(decision.into_result(), Err(ChatError::Moderated { .. })));

        // Further messages are refused outright
        let next = engine.enforce(channel, author, "hello").await;
        assert!(matches!(next, Err(ChatError::Unauthorized(_))));
        assert!(engine.enforce(channel, Uuid::new_v4(), "hello").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_violation_recording_is_best_effort() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(Arc::clone(&store));
        engine
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Delete))
            .await
            .unwrap();

        // One failure is absorbed by the retry
        store.fail_next(FailPoint::RecordViolation, 1);
        let decision = engine.enforce(Uuid::new_v4(), Uuid::new_v4(), "spam").await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(store.violation_count(), 1);

        // Two failures drop the record but not the decision
        store.fail_next(FailPoint::RecordViolation, 2);
        let decision = engine.enforce(Uuid::new_v4(), Uuid::new_v4(), "spam").await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(store.violation_count(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_rule() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(Arc::clone(&store));
        let rule = engine
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Warn))
            .await
            .unwrap();
        let channel = Uuid::new_v4();

        engine
            .update_rule(
                rule.id,
                RuleUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!engine.check_message(channel, "spam").is_flagged());

        engine.delete_rule(rule.id).await.unwrap();
        assert!(engine.list_rules().is_empty());
        assert!(matches!(
            engine.delete_rule(rule.id).await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let store = Arc::new(InMemoryStore::new());
        let first = engine_with(Arc::clone(&store));
        first
            .create_rule(NewRule::new("spam", "no spam", ModerationAction::Warn))
            .await
            .unwrap();

        let second = ModerationEngine::load(store, Hub::new(), ModerationConfig::default())
            .await
            .unwrap();
        assert_eq!(second.list_rules().len(), 1);
        assert!(second.check_message(Uuid::new_v4(), "spam").is_flagged());
    }
}
