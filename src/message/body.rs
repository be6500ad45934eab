//! Body transfer codecs, one per message type.

use serde::{Deserialize, Serialize};

use super::{MessageError, MessageType, Result};

/// Decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Bytes(Vec<u8>),
    Text(String),
    Object(serde_json::Value),
    Notice(Notice),
    Empty,
}

impl MessageBody {
    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Bytes(_) => "bytes",
            MessageBody::Text(_) => "text",
            MessageBody::Object(_) => "object",
            MessageBody::Notice(_) => "notice",
            MessageBody::Empty => "empty",
        }
    }

    /// Whether this body is the representation used by `message_type`.
    pub fn fits(&self, message_type: MessageType) -> bool {
        matches!(
            (message_type, self),
            (MessageType::AppMessage, MessageBody::Bytes(_))
                | (MessageType::TextMessage, MessageBody::Text(_))
                | (MessageType::ObjectMessage, MessageBody::Object(_))
                | (MessageType::NoticeMessage, MessageBody::Notice(_))
                | (MessageType::HeartbeatMessage, MessageBody::Empty)
        )
    }
}

/// Severity of a [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Critical,
}

/// Structured notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub content: String,
    pub level: NoticeLevel,
}

/// Encodes and decodes the body of one message type.
pub trait BodyCodec: Send + Sync {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>>;

    fn decode(&self, message_type: MessageType, bytes: &[u8]) -> Result<MessageBody>;
}

fn mismatch(message_type: MessageType, body: &MessageBody) -> MessageError {
    MessageError::BodyMismatch {
        message_type,
        found: body.kind(),
    }
}

fn body_error(message_type: MessageType, reason: impl ToString) -> MessageError {
    MessageError::Body {
        message_type,
        reason: reason.to_string(),
    }
}

/// Raw bytes, passed through untouched.
#[derive(Debug, Default)]
pub struct AppBodyCodec;

impl BodyCodec for AppBodyCodec {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>> {
        match body {
            MessageBody::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(mismatch(message_type, other)),
        }
    }

    fn decode(&self, _message_type: MessageType, bytes: &[u8]) -> Result<MessageBody> {
        Ok(MessageBody::Bytes(bytes.to_vec()))
    }
}

/// UTF-8 text. Invalid UTF-8 is a decode error.
#[derive(Debug, Default)]
pub struct TextBodyCodec;

impl BodyCodec for TextBodyCodec {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>> {
        match body {
            MessageBody::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(mismatch(message_type, other)),
        }
    }

    fn decode(&self, message_type: MessageType, bytes: &[u8]) -> Result<MessageBody> {
        String::from_utf8(bytes.to_vec())
            .map(MessageBody::Text)
            .map_err(|e| body_error(message_type, e))
    }
}

/// JSON document.
#[derive(Debug, Default)]
pub struct ObjectBodyCodec;

impl BodyCodec for ObjectBodyCodec {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>> {
        match body {
            MessageBody::Object(value) => {
                serde_json::to_vec(value).map_err(|e| body_error(message_type, e))
            }
            other => Err(mismatch(message_type, other)),
        }
    }

    fn decode(&self, message_type: MessageType, bytes: &[u8]) -> Result<MessageBody> {
        serde_json::from_slice(bytes)
            .map(MessageBody::Object)
            .map_err(|e| body_error(message_type, e))
    }
}

/// [`Notice`] serialized as JSON.
#[derive(Debug, Default)]
pub struct NoticeBodyCodec;

impl BodyCodec for NoticeBodyCodec {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>> {
        match body {
            MessageBody::Notice(notice) => {
                serde_json::to_vec(notice).map_err(|e| body_error(message_type, e))
            }
            other => Err(mismatch(message_type, other)),
        }
    }

    fn decode(&self, message_type: MessageType, bytes: &[u8]) -> Result<MessageBody> {
        serde_json::from_slice::<Notice>(bytes)
            .map(MessageBody::Notice)
            .map_err(|e| body_error(message_type, e))
    }
}

/// Empty payload. A heartbeat carrying bytes is malformed.
#[derive(Debug, Default)]
pub struct HeartbeatBodyCodec;

impl BodyCodec for HeartbeatBodyCodec {
    fn encode(&self, message_type: MessageType, body: &MessageBody) -> Result<Vec<u8>> {
        match body {
            MessageBody::Empty => Ok(Vec::new()),
            other => Err(mismatch(message_type, other)),
        }
    }

    fn decode(&self, message_type: MessageType, bytes: &[u8]) -> Result<MessageBody> {
        if bytes.is_empty() {
            Ok(MessageBody::Empty)
        } else {
            Err(body_error(
                message_type,
                format!("expected empty payload, got {} bytes", bytes.len()),
            ))
        }
    }
}
