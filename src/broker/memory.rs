//! In-process broker for standalone mode and tests.
//!
//! Queues are unbounded tokio mpsc channels. Publishing routes by exact
//! `(exchange, routing_key)` binding to every bound queue; unroutable
//! publishes are dropped, as an AMQP broker would. Acks are recorded so
//! callers can observe them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelDestroyer, ChannelPool, Delivery,
    DeliverySource, Envelope, Result,
};
use crate::message::WireProperties;

/// An acknowledgment observed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub channel_id: u16,
    pub delivery_tag: u64,
    pub multiple: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    bindings: HashMap<(String, String), Vec<String>>,
    open_channels: HashSet<u16>,
    acks: Vec<AckRecord>,
    next_delivery_tag: u64,
    next_channel_id: u16,
}

/// In-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare) a queue and return its consumer side.
    ///
    /// Redeclaring replaces the previous consumer.
    pub async fn declare_queue(&self, queue: impl Into<String>) -> MemoryDeliverySource {
        let queue = queue.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.queues.insert(queue.clone(), tx);
        info!(queue = %queue, "Declared in-memory queue");
        MemoryDeliverySource { receiver: rx }
    }

    /// Bind a queue to an exchange for one routing key.
    pub async fn bind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) {
        let queue = queue.into();
        let key = (exchange.into(), routing_key.into());
        let mut state = self.state.lock().await;
        let bound = state.bindings.entry(key).or_default();
        if !bound.contains(&queue) {
            bound.push(queue);
        }
    }

    /// Open a new channel.
    pub async fn open_channel(&self) -> Result<Arc<MemoryChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker closed".to_string()));
        }
        let mut state = self.state.lock().await;
        state.next_channel_id = state.next_channel_id.wrapping_add(1);
        let id = state.next_channel_id;
        state.open_channels.insert(id);
        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
        }))
    }

    /// Close a channel. Returns false if it was not open.
    pub async fn close_channel(&self, id: u16) -> bool {
        self.state.lock().await.open_channels.remove(&id)
    }

    /// Number of channels currently open.
    pub async fn open_channel_count(&self) -> usize {
        self.state.lock().await.open_channels.len()
    }

    /// All acknowledgments seen so far, in arrival order.
    pub async fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().await.acks.clone()
    }

    /// Close the broker; further channel creation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn route(
        &self,
        channel_id: u16,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &WireProperties,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.open_channels.contains(&channel_id) {
            return Err(BrokerError::Closed(format!("channel {} is not open", channel_id)));
        }

        let queues = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default();

        if queues.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for queue in queues {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                properties: properties.clone(),
                body: body.to_vec(),
                envelope: Envelope {
                    delivery_tag: state.next_delivery_tag,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                },
            };
            if let Some(sender) = state.queues.get(&queue) {
                if sender.send(delivery).is_err() {
                    debug!(queue = %queue, "Queue consumer gone, message dropped");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel: Arc<dyn BrokerChannel> = self.open_channel().await?;
        Ok(channel)
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u16,
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        if !state.open_channels.contains(&self.id) {
            return Err(BrokerError::Ack(format!("channel {} is not open", self.id)));
        }
        state.acks.push(AckRecord {
            channel_id: self.id,
            delivery_tag,
            multiple,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &WireProperties,
    ) -> Result<()> {
        self.broker
            .route(self.id, exchange, routing_key, body, properties)
            .await
    }
}

/// Channel pool over a [`MemoryBroker`]; every acquire opens a fresh channel.
#[derive(Clone)]
pub struct MemoryPool {
    broker: MemoryBroker,
}

impl MemoryPool {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ChannelPool for MemoryPool {
    async fn acquire(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.broker.create_channel().await
    }

    fn destroyer(&self) -> Arc<dyn ChannelDestroyer> {
        Arc::new(self.broker.clone())
    }
}

#[async_trait]
impl ChannelDestroyer for MemoryBroker {
    async fn destroy(&self, channel: Arc<dyn BrokerChannel>) {
        if !self.close_channel(channel.id()).await {
            debug!(channel = channel.id(), "Destroy on channel that was not open");
        }
    }
}

/// Consumer side of an in-memory queue.
pub struct MemoryDeliverySource {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl DeliverySource for MemoryDeliverySource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        self.receiver.recv().await.map(Ok)
    }
}
