//! Header transfer between [`MessageHeader`] and broker properties.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{MessageError, MessageType, Result};

/// Value stored in the free-form header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(mode: u8) -> Option<Self> {
        match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// Broker-neutral message properties as they travel on the wire.
///
/// `kind` holds the message type tag. The remaining fields mirror AMQP basic
/// properties; `headers` is the free-form table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProperties {
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub cluster_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl WireProperties {
    /// The type tag, if present and non-empty.
    pub fn type_tag(&self) -> Option<&str> {
        self.kind.as_deref().filter(|tag| !tag.is_empty())
    }
}

/// Structured message header.
///
/// Timestamps travel with second precision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeader {
    pub message_id: Option<u64>,
    /// Whole seconds, not before the Unix epoch; anything else fails to encode.
    pub timestamp: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds.
    pub expiration_ms: Option<u64>,
    pub delivery_mode: Option<DeliveryMode>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub cluster_id: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl MessageHeader {
    /// Set the timestamp to now, truncated to whole seconds.
    pub fn stamp_now(&mut self) {
        self.timestamp = DateTime::from_timestamp(Utc::now().timestamp(), 0);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(key.into(), value.into());
    }
}

/// Wire form of a timestamp: whole seconds since the Unix epoch.
fn timestamp_to_wire(ts: DateTime<Utc>) -> Result<u64> {
    if ts.timestamp_subsec_nanos() != 0 {
        return Err(MessageError::Header(format!(
            "timestamp {} has sub-second precision",
            ts
        )));
    }
    u64::try_from(ts.timestamp())
        .map_err(|_| MessageError::Header(format!("timestamp {} is before the Unix epoch", ts)))
}

/// Encode a header into wire properties tagged with `message_type`.
///
/// Fails for values the wire cannot carry exactly: timestamps before the
/// epoch or with a sub-second part.
pub fn encode_header(header: &MessageHeader, message_type: MessageType) -> Result<WireProperties> {
    let timestamp = header.timestamp.map(timestamp_to_wire).transpose()?;

    Ok(WireProperties {
        kind: Some(message_type.tag().to_string()),
        message_id: header.message_id.map(|id| id.to_string()),
        timestamp,
        priority: header.priority,
        expiration: header.expiration_ms.map(|ms| ms.to_string()),
        delivery_mode: header.delivery_mode.map(DeliveryMode::as_u8),
        content_type: header.content_type.clone(),
        content_encoding: header.content_encoding.clone(),
        correlation_id: header.correlation_id.clone(),
        reply_to: header.reply_to.clone(),
        app_id: header.app_id.clone(),
        user_id: header.user_id.clone(),
        cluster_id: header.cluster_id.clone(),
        headers: header.headers.clone(),
    })
}

/// Decode wire properties into a header for `message_type`.
pub fn decode_header(
    properties: &WireProperties,
    message_type: MessageType,
) -> Result<MessageHeader> {
    if let Some(tag) = properties.type_tag() {
        if tag != message_type.tag() {
            return Err(MessageError::Header(format!(
                "type tag {} does not match {}",
                tag, message_type
            )));
        }
    }

    let message_id = properties
        .message_id
        .as_deref()
        .map(|id| {
            id.parse::<u64>()
                .map_err(|e| MessageError::Header(format!("invalid message id {:?}: {}", id, e)))
        })
        .transpose()?;

    let timestamp = properties
        .timestamp
        .map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| MessageError::Header(format!("timestamp out of range: {}", secs)))
        })
        .transpose()?;

    let expiration_ms = properties
        .expiration
        .as_deref()
        .map(|exp| {
            exp.parse::<u64>()
                .map_err(|e| MessageError::Header(format!("invalid expiration {:?}: {}", exp, e)))
        })
        .transpose()?;

    let delivery_mode = properties
        .delivery_mode
        .map(|mode| {
            DeliveryMode::from_u8(mode)
                .ok_or_else(|| MessageError::Header(format!("invalid delivery mode: {}", mode)))
        })
        .transpose()?;

    Ok(MessageHeader {
        message_id,
        timestamp,
        priority: properties.priority,
        expiration_ms,
        delivery_mode,
        content_type: properties.content_type.clone(),
        content_encoding: properties.content_encoding.clone(),
        correlation_id: properties.correlation_id.clone(),
        reply_to: properties.reply_to.clone(),
        app_id: properties.app_id.clone(),
        user_id: properties.user_id.clone(),
        cluster_id: properties.cluster_id.clone(),
        headers: properties.headers.clone(),
    })
}
