//! Fixtures shared by the Pulse Chat benchmarks.

use pulse_chat_core::{
    ConnectionHandle, Hub, HubConfig, InMemoryStore, MatchMode, ModerationAction,
    ModerationConfig, ModerationEngine, NewRule,
};
use pulse_chat_protocol::{Event, EventKind};
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// Multi-threaded runtime for hub dispatchers.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
#[must_use]
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

/// A `message-created` event whose content is `content_len` bytes long.
#[must_use]
pub fn message_event(channel_id: Uuid, content_len: usize) -> Event {
    Event::new(
        EventKind::MessageCreated,
        channel_id,
        serde_json::json!({
            "id": Uuid::new_v4(),
            "channel_id": channel_id,
            "author_id": Uuid::new_v4(),
            "content": "x".repeat(content_len),
            "kind": "text",
        }),
    )
}

/// A hub with `listeners` connections registered on one channel. Outbound
/// queues are sized so a benchmark iteration never overflows them.
///
/// Must be called within a Tokio runtime.
///
/// # Panics
///
/// Panics if registration fails.
#[must_use]
pub fn fanout_hub(listeners: usize, queue_depth: usize) -> (Hub, Uuid, Vec<ConnectionHandle>) {
    let hub = Hub::with_config(HubConfig {
        outbound_capacity: queue_depth,
        dispatch_capacity: queue_depth,
        ..HubConfig::default()
    });
    let channel_id = Uuid::new_v4();
    let handles = (0..listeners)
        .map(|_| {
            let handle = hub.connect(Uuid::new_v4());
            hub.register(handle.id(), &[channel_id])
                .expect("failed to register benchmark connection");
            handle
        })
        .collect();
    (hub, channel_id, handles)
}

/// Word list mixed into generated rules and messages.
const WORDS: [&str; 8] = [
    "spam", "scam", "phishing", "giveaway", "crypto", "free", "winner", "prize",
];

/// A moderation engine with `rules` active global rules.
///
/// # Panics
///
/// Panics if a generated rule is rejected.
#[must_use]
pub fn moderation_engine(rt: &Runtime, rules: usize, mode: MatchMode) -> ModerationEngine {
    rt.block_on(async {
        let store = Arc::new(InMemoryStore::new());
        let config = ModerationConfig {
            match_mode: mode,
            ..ModerationConfig::default()
        };
        let engine = ModerationEngine::new(store, Hub::new(), config);
        for i in 0..rules {
            let pattern = format!("{}{}", WORDS[i % WORDS.len()], i);
            engine
                .create_rule(NewRule::new(pattern, "generated", ModerationAction::Warn))
                .await
                .expect("failed to create benchmark rule");
        }
        engine
    })
}

/// Message text of roughly `words` words that matches no generated rule.
#[must_use]
pub fn clean_text(words: usize) -> String {
    (0..words)
        .map(|i| WORDS[i % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}
