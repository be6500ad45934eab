//! Message model: type registry, headers and bodies.
//!
//! Every message on the bus carries a wire type tag in its broker properties.
//! The tag selects exactly one [`MessageType`], and the type selects the
//! codec used for the body. Both lookups are closed `match` tables; an
//! unregistered tag is an error, never a silent default.

mod body;
mod header;

use std::fmt;
use std::str::FromStr;

pub use body::{
    AppBodyCodec, BodyCodec, HeartbeatBodyCodec, MessageBody, Notice, NoticeBodyCodec,
    NoticeLevel, ObjectBodyCodec, TextBodyCodec,
};
pub use header::{
    decode_header, encode_header, DeliveryMode, HeaderValue, MessageHeader, WireProperties,
};

/// Result type for message encoding and decoding.
pub type Result<T> = std::result::Result<T, MessageError>;

/// Errors raised while resolving, encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("header transfer failed: {0}")]
    Header(String),

    #[error("{message_type} body transfer failed: {reason}")]
    Body {
        message_type: MessageType,
        reason: String,
    },

    #[error("{0} message has no body")]
    MissingBody(MessageType),

    #[error("{message_type} message cannot carry a {found} body")]
    BodyMismatch {
        message_type: MessageType,
        found: &'static str,
    },
}

/// Closed set of message types known to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Opaque application payload.
    AppMessage,
    /// UTF-8 text.
    TextMessage,
    /// Arbitrary JSON document.
    ObjectMessage,
    /// Structured notification.
    NoticeMessage,
    /// Liveness ping; carries no payload.
    HeartbeatMessage,
}

impl MessageType {
    /// All registered types, in tag order.
    pub const ALL: [MessageType; 5] = [
        MessageType::AppMessage,
        MessageType::TextMessage,
        MessageType::ObjectMessage,
        MessageType::NoticeMessage,
        MessageType::HeartbeatMessage,
    ];

    /// Wire tag written to the broker's `type` property.
    pub const fn tag(self) -> &'static str {
        match self {
            MessageType::AppMessage => "appMessage",
            MessageType::TextMessage => "textMessage",
            MessageType::ObjectMessage => "objectMessage",
            MessageType::NoticeMessage => "noticeMessage",
            MessageType::HeartbeatMessage => "heartbeatMessage",
        }
    }

    /// Resolve a wire tag. Unknown tags fail with [`MessageError::UnknownType`].
    pub fn lookup(tag: &str) -> Result<Self> {
        match tag {
            "appMessage" => Ok(MessageType::AppMessage),
            "textMessage" => Ok(MessageType::TextMessage),
            "objectMessage" => Ok(MessageType::ObjectMessage),
            "noticeMessage" => Ok(MessageType::NoticeMessage),
            "heartbeatMessage" => Ok(MessageType::HeartbeatMessage),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Body codec for this type.
    pub fn body_codec(self) -> &'static dyn BodyCodec {
        static APP: AppBodyCodec = AppBodyCodec;
        static TEXT: TextBodyCodec = TextBodyCodec;
        static OBJECT: ObjectBodyCodec = ObjectBodyCodec;
        static NOTICE: NoticeBodyCodec = NoticeBodyCodec;
        static HEARTBEAT: HeartbeatBodyCodec = HeartbeatBodyCodec;

        match self {
            MessageType::AppMessage => &APP,
            MessageType::TextMessage => &TEXT,
            MessageType::ObjectMessage => &OBJECT,
            MessageType::NoticeMessage => &NOTICE,
            MessageType::HeartbeatMessage => &HEARTBEAT,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::lookup(s)
    }
}

/// A typed message.
///
/// The type is fixed at construction; header and body are set independently.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: MessageType,
    header: MessageHeader,
    body: Option<MessageBody>,
}

impl Message {
    /// Create an empty message shell of the given type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            header: MessageHeader::default(),
            body: None,
        }
    }

    /// Create a message with its body already set.
    pub fn with_body(message_type: MessageType, body: MessageBody) -> Self {
        Self {
            message_type,
            header: MessageHeader::default(),
            body: Some(body),
        }
    }

    pub fn app(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_body(MessageType::AppMessage, MessageBody::Bytes(payload.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::with_body(MessageType::TextMessage, MessageBody::Text(text.into()))
    }

    pub fn object(value: serde_json::Value) -> Self {
        Self::with_body(MessageType::ObjectMessage, MessageBody::Object(value))
    }

    pub fn notice(notice: Notice) -> Self {
        Self::with_body(MessageType::NoticeMessage, MessageBody::Notice(notice))
    }

    pub fn heartbeat() -> Self {
        Self::with_body(MessageType::HeartbeatMessage, MessageBody::Empty)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    pub fn set_header(&mut self, header: MessageHeader) {
        self.header = header;
    }

    pub fn body(&self) -> Option<&MessageBody> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: MessageBody) {
        self.body = Some(body);
    }

    /// Check that the body is present and matches the message type, and
    /// that the header can be put on the wire.
    pub fn validate(&self) -> Result<()> {
        encode_header(&self.header, self.message_type)?;
        let body = self
            .body
            .as_ref()
            .ok_or(MessageError::MissingBody(self.message_type))?;
        if body.fits(self.message_type) {
            Ok(())
        } else {
            Err(MessageError::BodyMismatch {
                message_type: self.message_type,
                found: body.kind(),
            })
        }
    }

    /// Encode into broker properties and body bytes.
    pub fn encode(&self) -> Result<(WireProperties, Vec<u8>)> {
        let body = self
            .body
            .as_ref()
            .ok_or(MessageError::MissingBody(self.message_type))?;
        let bytes = self.message_type.body_codec().encode(self.message_type, body)?;
        let properties = encode_header(&self.header, self.message_type)?;
        Ok((properties, bytes))
    }

    /// Decode a delivery already resolved to `message_type`.
    pub fn decode(
        message_type: MessageType,
        properties: &WireProperties,
        body: &[u8],
    ) -> Result<Self> {
        let mut message = Message::new(message_type);
        message.set_header(decode_header(properties, message_type)?);
        message.set_body(message_type.body_codec().decode(message_type, body)?);
        Ok(message)
    }
}

#[cfg(test)]
mod tests;
