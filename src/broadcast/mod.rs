//! Broadcast send path.
//!
//! A broadcast builds a fresh [`MessageContext`], validates that the client
//! may send, runs the PRE segment, publishes every message in list order,
//! releases the channel, then runs the POST segment.
//!
//! A broker rejecting a publish is logged and swallowed: the first rejection
//! abandons the remaining messages of that call, the channel is still
//! released exactly once, and POST still runs. A missing channel or a message
//! that fails to encode is returned to the caller after the channel is
//! released, and POST is skipped. An empty batch publishes nothing but still
//! runs both segments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::broker::{
    produce, BrokerConnection, BrokerError, ChannelPool, PROXY_EXCHANGE_NAME, PUBSUB_ROUTING_KEY,
};
use crate::context::{CarryType, MessageContext};
use crate::error::{BusError, Result};
use crate::handler::{HandlerChain, HandlerPipeline};
use crate::message::Message;

/// Resolves an application id to its source node (queue).
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, app_id: &str) -> Option<String>;
}

/// Address table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressResolver {
    nodes: BTreeMap<String, String>,
}

impl StaticAddressResolver {
    pub fn new(nodes: BTreeMap<String, String>) -> Self {
        Self { nodes }
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve(&self, app_id: &str) -> Option<String> {
        self.nodes.get(app_id).cloned()
    }
}

/// Checks that the client is in a state that allows sending.
pub trait StateCheck: Send + Sync {
    fn check_state(&self) -> Result<()>;
}

/// Open/closed flag of a client.
#[derive(Debug)]
pub struct ClientState {
    open: AtomicBool,
}

impl ClientState {
    pub fn open() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl StateCheck for ClientState {
    fn check_state(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::InvalidState("client is closed".to_string()))
        }
    }
}

/// The caller's long-lived context: identity and broker resources.
#[derive(Clone)]
pub struct CarrierContext {
    pub app_id: String,
    pub pool: Option<Arc<dyn ChannelPool>>,
    pub connection: Option<Arc<dyn BrokerConnection>>,
}

impl CarrierContext {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            pool: None,
            connection: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn ChannelPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_connection(mut self, connection: Arc<dyn BrokerConnection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

/// Publishes message batches to every subscriber through the proxy exchange.
pub struct Broadcaster {
    carrier: CarrierContext,
    pipeline: Arc<HandlerPipeline>,
    resolver: Arc<dyn AddressResolver>,
    state: Arc<dyn StateCheck>,
    exchange: String,
    routing_key: String,
}

impl Broadcaster {
    pub fn new(
        carrier: CarrierContext,
        pipeline: Arc<HandlerPipeline>,
        resolver: Arc<dyn AddressResolver>,
        state: Arc<dyn StateCheck>,
    ) -> Self {
        Self {
            carrier,
            pipeline,
            resolver,
            state,
            exchange: PROXY_EXCHANGE_NAME.to_string(),
            routing_key: PUBSUB_ROUTING_KEY.to_string(),
        }
    }

    /// Override the exchange and routing key.
    pub fn with_route(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Broadcast `messages` in order.
    #[tracing::instrument(
        name = "bus.broadcast",
        skip_all,
        fields(app_id = %self.carrier.app_id, count = messages.len())
    )]
    pub async fn broadcast(&self, messages: Vec<Message>) -> Result<()> {
        let mut ctx = MessageContext::new(CarryType::Broadcast, self.carrier.app_id.clone())
            .with_messages(messages);
        ctx.source_node = self.resolver.resolve(&self.carrier.app_id);
        ctx.pool = self.carrier.pool.clone();
        ctx.connection = self.carrier.connection.clone();

        self.check_state(&ctx)?;

        let mut chain = HandlerChain::new(Arc::clone(&self.pipeline));
        chain.start_pre();
        if let Err(e) = chain.handle(&mut ctx).await {
            ctx.release_channel().await;
            return Err(e.into());
        }

        let published = self.publish_all(&ctx).await;
        ctx.release_channel().await;
        published?;

        chain.start_post();
        chain.handle(&mut ctx).await?;

        Ok(())
    }

    fn check_state(&self, ctx: &MessageContext) -> Result<()> {
        self.state.check_state()?;

        if let Some(connection) = &ctx.connection {
            if !connection.is_open() {
                return Err(BusError::InvalidState("connection is closed".to_string()));
            }
        }

        for (index, msg) in ctx.messages().iter().enumerate() {
            msg.validate()
                .map_err(|e| BusError::InvalidMessage(format!("message {}: {}", index, e)))?;
        }

        Ok(())
    }

    async fn publish_all(&self, ctx: &MessageContext) -> Result<()> {
        if ctx.messages().is_empty() {
            return Ok(());
        }
        let channel = ctx.channel.as_ref().ok_or(BrokerError::NoChannel)?;

        for (index, msg) in ctx.messages().iter().enumerate() {
            let (properties, body) = msg.encode()?;
            if let Err(e) =
                produce(&self.exchange, &**channel, &self.routing_key, &body, &properties).await
            {
                error!(
                    app_id = %ctx.app_id,
                    index,
                    remaining = ctx.messages().len() - index,
                    error = %e,
                    "Broadcast publish failed, abandoning rest of batch"
                );
                break;
            }
            debug!(message_type = %msg.message_type(), "Broadcast message published");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
