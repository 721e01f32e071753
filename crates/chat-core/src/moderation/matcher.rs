//! Pattern compilation and matching.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::ModerationRule;

/// How a rule pattern is located in message content. Matching is always
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// The occurrence must not be glued to a letter or digit on either side.
    /// `spam` matches "spam!" and "(spam)" but not "antispam".
    #[default]
    Boundary,
    /// Any occurrence counts.
    Substring,
}

/// Compile a literal pattern under `mode`.
///
/// # Errors
///
/// Returns an error only if the compiled program exceeds the regex size
/// limit.
pub fn compile(pattern: &str, mode: MatchMode) -> Result<Regex, regex::Error> {
    let literal = regex::escape(pattern.trim());
    let source = match mode {
        MatchMode::Boundary => format!(r"(?i)(?:^|[^\p{{L}}\p{{N}}]){}(?:$|[^\p{{L}}\p{{N}}])", literal),
        MatchMode::Substring => format!("(?i){}", literal),
    };
    Regex::new(&source)
}

struct CompiledRule {
    rule: ModerationRule,
    regex: Option<Regex>,
}

/// Immutable snapshot of every rule with its compiled pattern.
pub(crate) struct RuleSet {
    mode: MatchMode,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub(crate) fn new(mode: MatchMode, rules: Vec<ModerationRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let regex = match compile(&rule.pattern, mode) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!(rule = %rule.id, "Rule pattern failed to compile: {}", e);
                        None
                    }
                };
                CompiledRule { rule, regex }
            })
            .collect();
        Self { mode, rules }
    }

    pub(crate) fn mode(&self) -> MatchMode {
        self.mode
    }

    pub(crate) fn rules(&self) -> Vec<ModerationRule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    pub(crate) fn get(&self, rule_id: Uuid) -> Option<&ModerationRule> {
        self.rules.iter().map(|c| &c.rule).find(|rule| rule.id == rule_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }

    /// Rules in scope for `channel_id` that match `content`, highest
    /// severity first.
    pub(crate) fn matches(&self, channel_id: Uuid, content: &str) -> Vec<ModerationRule> {
        let mut matched: Vec<ModerationRule> = self
            .rules
            .iter()
            .filter(|c| c.rule.applies_to(channel_id))
            .filter(|c| c.regex.as_ref().is_some_and(|re| re.is_match(content)))
            .map(|c| c.rule.clone())
            .collect();
        matched.sort_by(|a, b| b.severity.cmp(&a.severity));
        matched
    }
}
