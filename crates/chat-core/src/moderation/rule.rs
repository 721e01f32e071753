//! Moderation records: rules, violations and restrictions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationAction {
    /// Notify only; the message goes through.
    Warn,
    /// Reject the message before persistence.
    Delete,
    /// Reject the message and silence the author for a while.
    Mute,
    /// Reject the message and bar the author for a while.
    Ban,
}

impl ModerationAction {
    /// Mute and ban carry a duration.
    #[inline]
    #[must_use]
    pub fn is_time_boxed(&self) -> bool {
        matches!(self, ModerationAction::Mute | ModerationAction::Ban)
    }

    /// Every action except `Warn` stops the triggering message.
    #[inline]
    #[must_use]
    pub fn rejects_message(&self) -> bool {
        !matches!(self, ModerationAction::Warn)
    }

    /// Restriction applied to the author, if any.
    #[must_use]
    pub fn restriction(&self) -> Option<RestrictionKind> {
        match self {
            ModerationAction::Mute => Some(RestrictionKind::Mute),
            ModerationAction::Ban => Some(RestrictionKind::Ban),
            _ => None,
        }
    }
}

/// Rule severity, used to order matches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A configured pattern-to-action mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRule {
    pub id: Uuid,
    pub pattern: String,
    pub description: String,
    pub action: ModerationAction,
    pub severity: Severity,
    /// Restriction length for mute/ban, in seconds.
    pub duration_secs: Option<u64>,
    pub is_active: bool,
    /// `None` applies the rule in every channel.
    pub channel_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModerationRule {
    /// Restriction length, if the rule carries one.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(Duration::seconds)
    }

    /// Whether the rule is evaluated for messages in `channel_id`.
    #[must_use]
    pub fn applies_to(&self, channel_id: Uuid) -> bool {
        self.is_active && self.channel_id.map_or(true, |scope| scope == channel_id)
    }
}

/// Input for creating a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub pattern: String,
    pub description: String,
    pub action: ModerationAction,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl NewRule {
    /// A global, active rule of medium severity.
    #[must_use]
    pub fn new(
        pattern: impl Into<String>,
        description: impl Into<String>,
        action: ModerationAction,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            description: description.into(),
            action,
            severity: Severity::default(),
            duration_secs: None,
            channel_id: None,
            is_active: true,
        }
    }

    #[must_use]
    pub fn with_duration_secs(mut self, secs: u64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn in_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = Some(channel_id);
        self
    }
}

/// Partial update of a rule. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub pattern: Option<String>,
    pub description: Option<String>,
    pub action: Option<ModerationAction>,
    pub severity: Option<Severity>,
    pub duration_secs: Option<u64>,
    pub is_active: Option<bool>,
}

/// Audit record of a rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationViolation {
    pub id: Uuid,
    pub rule_id: Uuid,
    /// Set when the matched message was persisted.
    pub message_id: Option<Uuid>,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub action: ModerationAction,
    pub pattern: String,
    /// Content that triggered the match.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of time-boxed restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictionKind {
    Mute,
    Ban,
}

/// A time-boxed mute or ban on a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restriction {
    pub user_id: Uuid,
    /// `None` applies everywhere.
    pub channel_id: Option<Uuid>,
    pub kind: RestrictionKind,
    pub rule_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl Restriction {
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    #[must_use]
    pub fn covers(&self, channel_id: Uuid) -> bool {
        self.channel_id.map_or(true, |scope| scope == channel_id)
    }
}
