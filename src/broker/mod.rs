//! Broker transport seam.
//!
//! The dispatch core never talks to a broker client directly. It goes through:
//! - [`BrokerChannel`]: acknowledge deliveries and publish payloads
//! - [`ChannelDestroyer`]: release a channel once its owner is done
//! - [`ChannelPool`]: hand out channels for a send
//! - [`BrokerConnection`]: the connection the pool draws from
//! - [`DeliverySource`]: blocking pull of the next delivery for one consumer
//!
//! Implementations: in-process [`memory`] broker, and AMQP via lapin
//! (`--features amqp`).

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::WireProperties;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod proxy;

pub use memory::{AckRecord, MemoryBroker, MemoryChannel, MemoryDeliverySource, MemoryPool};
pub use proxy::{produce, PROXY_EXCHANGE_NAME, PUBSUB_ROUTING_KEY};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker transport.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("No channel available on context")]
    NoChannel,
}

/// Addressing information for one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// One unit of data handed from the broker to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub properties: WireProperties,
    pub body: Vec<u8>,
    pub envelope: Envelope,
}

/// A broker channel: the handle deliveries are acked on and payloads are
/// published through.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel number, for diagnostics and release bookkeeping.
    fn id(&self) -> u16;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &WireProperties,
    ) -> Result<()>;

    /// Close the channel on the broker side. Destroyers call this.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Releases channels. Callers guarantee each channel is released once.
#[async_trait]
pub trait ChannelDestroyer: Send + Sync {
    async fn destroy(&self, channel: Arc<dyn BrokerChannel>);
}

/// Source of channels for the send path.
#[async_trait]
pub trait ChannelPool: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Destroyer that returns channels acquired from this pool.
    fn destroyer(&self) -> Arc<dyn ChannelDestroyer>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;
}

/// Pull side of one consumer.
///
/// `next_delivery` suspends until a delivery arrives. `None` means the
/// consumer was cancelled by the broker. Implementations must be cancel-safe:
/// the receive loop races this call against its shutdown signal.
#[async_trait]
pub trait DeliverySource: Send {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}
