//! Publish collaborator used by the send path.

use tracing::{debug, error};

use super::{BrokerChannel, Result};
use crate::message::WireProperties;

/// Exchange every client publishes into; the proxy fans out from there.
pub const PROXY_EXCHANGE_NAME: &str = "exchange.proxy";
/// Routing key for publish/subscribe and broadcast traffic.
pub const PUBSUB_ROUTING_KEY: &str = "routingkey.proxy.message.pubsub";

/// Publish one encoded message through `channel`.
pub async fn produce(
    exchange: &str,
    channel: &dyn BrokerChannel,
    routing_key: &str,
    body: &[u8],
    properties: &WireProperties,
) -> Result<()> {
    match channel.publish(exchange, routing_key, body, properties).await {
        Ok(()) => {
            debug!(
                exchange = %exchange,
                routing_key = %routing_key,
                channel = channel.id(),
                bytes = body.len(),
                "Produced message"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                exchange = %exchange,
                routing_key = %routing_key,
                channel = channel.id(),
                error = %e,
                "Produce failed"
            );
            Err(e)
        }
    }
}
