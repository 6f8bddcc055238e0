use serde::{Deserialize, Serialize};

use crate::envelope::{DecodeError, NotificationPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Sent back to the client that originated an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Status,
    pub message: String,
}

impl StatusResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Notification,
}

/// A notification fanned out to every connected client. Unlike the
/// inbound envelope, `data` travels as a plain object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBroadcast {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: NotificationPayload,
}

impl NotificationBroadcast {
    pub fn new(data: NotificationPayload) -> Self {
        Self {
            kind: MessageType::Notification,
            data,
        }
    }
}

/// Anything the relay sends down a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status(StatusResponse),
    Notification(NotificationBroadcast),
}

impl ServerMessage {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(raw.trim()).map_err(|e| DecodeError::InvalidJson(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Plain strings and unit enums; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<StatusResponse> for ServerMessage {
    fn from(s: StatusResponse) -> Self {
        ServerMessage::Status(s)
    }
}

impl From<NotificationBroadcast> for ServerMessage {
    fn from(n: NotificationBroadcast) -> Self {
        ServerMessage::Notification(n)
    }
}
