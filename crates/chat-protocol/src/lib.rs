//! # pulse-chat-protocol
//!
//! Wire definitions shared between the Pulse Chat core and its transports.
//!
//! ## Contents
//!
//! - `Event` - The broadcast record `{type, channel_id, payload, timestamp}`
//!   pushed to every live connection in a channel
//! - `ClientCommand` / `ServerReply` - The request surface spoken over a
//!   pre-established bidirectional connection
//! - `codec` - Length-prefixed MessagePack framing for events
//!
//! ## Example
//!
//! ```rust
//! use pulse_chat_protocol::{codec, Event, EventKind};
//! use uuid::Uuid;
//!
//! let event = Event::new(EventKind::MessageCreated, Uuid::new_v4(), serde_json::json!({"id": 1}));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.kind, EventKind::MessageCreated);
//! ```

pub mod codec;
pub mod commands;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use commands::{ClientCommand, ServerReply};
pub use events::{Event, EventKind};
