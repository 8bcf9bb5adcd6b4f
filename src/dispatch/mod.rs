//! Push delivery to live connections.
//!
//! The notifier hands every message to a [`MessageDispatcher`]. Three
//! implementations ship with the crate: an in-process [`hub::ConnectionHub`],
//! an [`http::HttpDispatcher`] that posts to a connection-management
//! endpoint, and a [`recording::RecordingDispatcher`] for tests.

pub mod http;
pub mod hub;
pub mod recording;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CallContext;

pub use http::HttpDispatcher;
pub use hub::ConnectionHub;
pub use recording::RecordingDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SessionCreated,
    SessionUpdated,
    FacilitatorSessionLoaded,
    SessionLoaded,
    ErrorEncountered,
}

/// Envelope pushed to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub body: Value,
}

impl Message {
    pub fn new<T: Serialize>(kind: MessageType, body: &T) -> Result<Self, DeliveryError> {
        Ok(Self {
            kind,
            body: serde_json::to_value(body)?,
        })
    }

    /// `ERROR_ENCOUNTERED` carrying a request id the client can report.
    pub fn error(request_id: &str) -> Self {
        Self {
            kind: MessageType::ErrorEncountered,
            body: serde_json::json!({ "requestId": request_id }),
        }
    }
}

/// Failure to reach one connection. Never fatal to a fan-out.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection {0} is gone")]
    Gone(String),

    #[error("Delivery timed out")]
    Timeout,

    #[error("Connection {0} outbound queue is full")]
    Full(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn deliver(
        &self,
        ctx: &CallContext,
        connection_id: &str,
        message: &Message,
    ) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::new(MessageType::FacilitatorSessionLoaded, &serde_json::json!({"a": 1}))
            .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "FACILITATOR_SESSION_LOADED");
        assert_eq!(json["body"]["a"], 1);
    }

    #[test]
    fn test_error_message() {
        let msg = Message::error("req-1");
        assert_eq!(msg.kind, MessageType::ErrorEncountered);
        assert_eq!(msg.body["requestId"], "req-1");
    }
}
