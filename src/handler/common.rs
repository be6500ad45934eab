//! Built-in handlers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{HandlerError, HandlerFlow, MessageHandler};
use crate::context::MessageContext;
use crate::message::{Message, MessageType};

/// Borrow a channel from the context's pool.
///
/// Installs the pool's destroyer unless the context already has one, so the
/// send path can release the channel afterwards. A context that already holds
/// a channel is left alone.
#[derive(Debug, Default)]
pub struct AcquireChannel;

#[async_trait]
impl MessageHandler for AcquireChannel {
    fn name(&self) -> &str {
        "acquire-channel"
    }

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        if ctx.channel.is_some() {
            return Ok(HandlerFlow::Continue);
        }

        let pool = ctx.pool.clone().ok_or_else(|| HandlerError::Failed {
            handler: self.name().to_string(),
            reason: "context has no channel pool".to_string(),
        })?;

        let channel = pool.acquire().await?;
        debug!(channel = channel.id(), app_id = %ctx.app_id, "Acquired channel");
        ctx.channel = Some(channel);
        if ctx.destroyer.is_none() {
            ctx.destroyer = Some(pool.destroyer());
        }

        Ok(HandlerFlow::Continue)
    }
}

/// Reject messages whose wire body exceeds `max_bytes`.
///
/// Outgoing messages are measured by running their body codec. A consumed
/// message is measured by the delivery body it arrived in.
#[derive(Debug)]
pub struct ValidateBodySize {
    max_bytes: usize,
}

impl ValidateBodySize {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn encoded_len(&self, msg: &Message) -> Result<Option<usize>, HandlerError> {
        let Some(body) = msg.body() else {
            return Ok(None);
        };
        let message_type = msg.message_type();
        let bytes = message_type
            .body_codec()
            .encode(message_type, body)
            .map_err(|e| HandlerError::Failed {
                handler: self.name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(bytes.len()))
    }

    fn check(&self, message_type: MessageType, len: usize) -> Result<(), HandlerError> {
        if len > self.max_bytes {
            return Err(HandlerError::Rejected {
                handler: self.name().to_string(),
                reason: format!(
                    "{} body of {} bytes exceeds limit of {}",
                    message_type, len, self.max_bytes
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ValidateBodySize {
    fn name(&self) -> &str {
        "validate-body-size"
    }

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        for msg in ctx.messages() {
            if let Some(len) = self.encoded_len(msg)? {
                self.check(msg.message_type(), len)?;
            }
        }

        if let Some(msg) = ctx.consumed_msg() {
            let len = match ctx.consumed_body_len() {
                Some(len) => Some(len),
                None => self.encoded_len(msg)?,
            };
            if let Some(len) = len {
                self.check(msg.message_type(), len)?;
            }
        }

        Ok(HandlerFlow::Continue)
    }
}

/// Stop the chain for consumed messages whose type is not accepted.
#[derive(Debug)]
pub struct TypeFilter {
    accepted: HashSet<MessageType>,
}

impl TypeFilter {
    pub fn new(accepted: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MessageHandler for TypeFilter {
    fn name(&self) -> &str {
        "type-filter"
    }

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        match ctx.consumed_msg() {
            Some(msg) if !self.accepted.contains(&msg.message_type()) => {
                debug!(message_type = %msg.message_type(), "Filtered out consumed message");
                Ok(HandlerFlow::Stop)
            }
            _ => Ok(HandlerFlow::Continue),
        }
    }
}

/// Application callback for consumed messages.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &Message, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// Hand the consumed message to a [`MessageListener`].
pub struct DeliverToListener {
    listener: Arc<dyn MessageListener>,
}

impl DeliverToListener {
    pub fn new(listener: Arc<dyn MessageListener>) -> Self {
        Self { listener }
    }
}

#[async_trait]
impl MessageHandler for DeliverToListener {
    fn name(&self) -> &str {
        "deliver-to-listener"
    }

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        if let Some(msg) = ctx.consumed_msg() {
            self.listener.on_message(msg, ctx).await?;
        }
        Ok(HandlerFlow::Continue)
    }
}

/// Debug-log the traffic passing through the chain.
#[derive(Debug, Default)]
pub struct LogMessages;

#[async_trait]
impl MessageHandler for LogMessages {
    fn name(&self) -> &str {
        "log-messages"
    }

    async fn handle(&self, ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        for msg in ctx.messages() {
            debug!(
                app_id = %ctx.app_id,
                carry_type = ?ctx.carry_type,
                message_type = %msg.message_type(),
                message_id = ?msg.header().message_id,
                "Outgoing message"
            );
        }
        if let Some(msg) = ctx.consumed_msg() {
            debug!(
                app_id = %ctx.app_id,
                carry_type = ?ctx.carry_type,
                message_type = %msg.message_type(),
                message_id = ?msg.header().message_id,
                "Consumed message"
            );
        }
        Ok(HandlerFlow::Continue)
    }
}
