//! Client requests and server replies.
//!
//! Commands travel as JSON text frames; broadcast events use the binary codec.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands sent from a client over its live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Post a message to a channel.
    SendMessage {
        request_id: u64,
        channel_id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
    },

    /// Replace the content of one of the caller's messages.
    EditMessage {
        request_id: u64,
        message_id: Uuid,
        content: String,
    },

    /// Soft-delete a message.
    DeleteMessage { request_id: u64, message_id: Uuid },

    /// React to a message.
    AddReaction {
        request_id: u64,
        message_id: Uuid,
        emoji: String,
    },

    /// Withdraw a reaction.
    RemoveReaction {
        request_id: u64,
        message_id: Uuid,
        emoji: String,
    },

    /// Mark a message as read by the caller.
    MarkRead { request_id: u64, message_id: Uuid },

    /// Keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientCommand {
    /// Request id to echo in the reply, if the command expects one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientCommand::SendMessage { request_id, .. }
            | ClientCommand::EditMessage { request_id, .. }
            | ClientCommand::DeleteMessage { request_id, .. }
            | ClientCommand::AddReaction { request_id, .. }
            | ClientCommand::RemoveReaction { request_id, .. }
            | ClientCommand::MarkRead { request_id, .. } => Some(*request_id),
            ClientCommand::Ping { .. } => None,
        }
    }
}

/// Replies sent to the client that issued a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerReply {
    /// The command succeeded; `data` carries the persisted entity.
    Ok {
        request_id: u64,
        data: serde_json::Value,
    },

    /// The command failed with a typed error.
    Error {
        request_id: u64,
        code: String,
        message: String,
    },

    /// Keepalive answer.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerReply {
    /// Build an error reply.
    #[must_use]
    pub fn error(request_id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerReply::Error {
            request_id,
            code: code.into(),
            message: message.into(),
        }
    }
}
