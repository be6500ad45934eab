//! Per-run message context.
//!
//! One [`MessageContext`] threads addressing, payload and broker resources
//! through a single pipeline run: one broadcast call, or one delivery on the
//! receive loop. It is owned by the task running that pipeline.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::broker::{BrokerChannel, BrokerConnection, ChannelDestroyer, ChannelPool};
use crate::message::Message;

/// How a message is carried over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CarryType {
    Produce,
    Consume,
    Request,
    Response,
    Publish,
    Subscribe,
    Broadcast,
}

/// Mutable envelope for one pipeline run.
#[derive(Clone)]
pub struct MessageContext {
    /// Application the run is performed for.
    pub app_id: String,
    /// Resolved queue/node of `app_id`.
    pub source_node: Option<String>,
    pub carry_type: CarryType,
    messages: Arc<[Message]>,
    consumed_msg: Option<Message>,
    consumed_body_len: Option<usize>,
    pub channel: Option<Arc<dyn BrokerChannel>>,
    pub connection: Option<Arc<dyn BrokerConnection>>,
    pub pool: Option<Arc<dyn ChannelPool>>,
    pub destroyer: Option<Arc<dyn ChannelDestroyer>>,
}

impl MessageContext {
    pub fn new(carry_type: CarryType, app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            source_node: None,
            carry_type,
            messages: Arc::from(Vec::<Message>::new()),
            consumed_msg: None,
            consumed_body_len: None,
            channel: None,
            connection: None,
            pool: None,
            destroyer: None,
        }
    }

    /// Set the outgoing messages. The list is fixed for the rest of the run.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Arc::from(messages);
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn BrokerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_destroyer(mut self, destroyer: Arc<dyn ChannelDestroyer>) -> Self {
        self.destroyer = Some(destroyer);
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Message decoded from the current delivery (receive path only).
    pub fn consumed_msg(&self) -> Option<&Message> {
        self.consumed_msg.as_ref()
    }

    pub(crate) fn set_consumed_msg(&mut self, message: Message) {
        self.consumed_msg = Some(message);
    }

    /// Size of the delivery body the consumed message was decoded from.
    pub fn consumed_body_len(&self) -> Option<usize> {
        self.consumed_body_len
    }

    pub(crate) fn set_consumed_body_len(&mut self, len: usize) {
        self.consumed_body_len = Some(len);
    }

    /// Release the context's channel through its destroyer.
    ///
    /// The channel is taken out of the context, so a second call is a no-op.
    /// Returns whether a channel was released.
    pub async fn release_channel(&mut self) -> bool {
        let Some(channel) = self.channel.take() else {
            return false;
        };
        match &self.destroyer {
            Some(destroyer) => destroyer.destroy(channel).await,
            None => warn!(
                channel = channel.id(),
                app_id = %self.app_id,
                "No destroyer on context, dropping channel"
            ),
        }
        true
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("app_id", &self.app_id)
            .field("source_node", &self.source_node)
            .field("carry_type", &self.carry_type)
            .field("messages", &self.messages.len())
            .field("consumed_msg", &self.consumed_msg)
            .field("consumed_body_len", &self.consumed_body_len)
            .field("channel", &self.channel.as_ref().map(|c| c.id()))
            .field("has_pool", &self.pool.is_some())
            .field("has_destroyer", &self.destroyer.is_some())
            .finish()
    }
}
