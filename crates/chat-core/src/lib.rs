//! # pulse-chat-core
//!
//! Channel messaging core for Pulse Chat.
//!
//! This crate provides the building blocks behind the chat server:
//!
//! - **Hub** - Live connections and per-channel event fan-out
//! - **Delivery** - Per-recipient sent/delivered/read tracking
//! - **Attachment** - Validated, cancellable upload pipeline
//! - **Moderation** - Pattern rules, violations and restrictions
//! - **Service** - The request surface that wires them together
//! - **Store** - Storage interfaces and in-memory implementations
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   request ─────▶│ ChatService  │
//!                 └──────┬───────┘
//!        ┌───────────────┼────────────────┬───────────────┐
//!        ▼               ▼                ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌──────────────┐ ┌─────────────┐
//! │ Moderation  │ │    Store    │ │   Delivery   │ │ Attachments │
//! └──────┬──────┘ └─────────────┘ └──────┬───────┘ └──────┬──────┘
//!        │                               │                │
//!        └───────────────┬───────────────┴────────────────┘
//!                        ▼
//!                 ┌─────────────┐
//!                 │     Hub     │────▶ connections
//!                 └─────────────┘
//! ```

pub mod attachment;
pub mod delivery;
pub mod error;
pub mod events;
pub mod hub;
pub mod model;
pub mod moderation;
pub mod service;
pub mod store;

pub use attachment::{AttachmentConfig, AttachmentPipeline, UploadRequest};
pub use delivery::{DeliveryConfig, DeliveryTracker, SweepReport};
pub use error::{ChatError, ChatResult};
pub use hub::{
    BroadcastReceipt, ConnectionHandle, ConnectionId, ConnectionState, Hub, HubConfig, HubError,
    HubStats,
};
pub use moderation::{
    Decision, MatchMode, ModerationAction, ModerationConfig, ModerationEngine, ModerationRule,
    NewRule, Severity, Verdict,
};
pub use service::{ChatService, CoreConfig, SendMessage, ServiceConfig};
pub use store::{InMemoryStore, LocalBlobStore, MemoryBlobStore};
