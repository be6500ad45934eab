//! messagebus-tap: log every message arriving on a queue
//!
//! Consumes the configured queue through a [`ReceiveEventLoop`] and logs each
//! decoded message until Ctrl-C or until the loop dies.
//!
//! ## Usage
//! ```text
//! messagebus-tap [config.yaml]
//! ```
//!
//! ## Configuration
//! - MESSAGEBUS_CONFIG: configuration file (optional)
//! - MESSAGEBUS__AMQP__URL: broker URL (default: amqp://localhost:5672)
//! - MESSAGEBUS__CLIENT__APP_ID / MESSAGEBUS__CLIENT__QUEUE: what to consume
//! - MESSAGEBUS_LOG: log filter (default: info)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use messagebus::broker::amqp::{AmqpPool, ClosingDestroyer};
use messagebus::config::Config;
use messagebus::handler::{DeliverToListener, HandlerError, LogMessages, MessageListener};
use messagebus::utils::bootstrap::{connect_with_retry, init_tracing};
use messagebus::{CarryType, HandlerPipeline, Message, MessageContext, ReceiveEventLoop};

const CONNECT_ATTEMPTS: u32 = 30;
const POOL_SIZE: usize = 2;

struct TapListener;

#[async_trait]
impl MessageListener for TapListener {
    async fn on_message(
        &self,
        message: &Message,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        info!(
            app_id = %ctx.app_id,
            message_type = %message.message_type(),
            message_id = ?message.header().message_id,
            body = ?message.body(),
            "Message received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let queue = config.consumer_queue().ok_or_else(|| {
        format!(
            "no queue configured for app '{}': set client.queue or an apps entry",
            config.client.app_id
        )
    })?;

    let pool = connect_with_retry(&config.amqp.url, CONNECT_ATTEMPTS, || {
        AmqpPool::connect(config.amqp.url.clone(), POOL_SIZE)
    })
    .await?;

    pool.declare_exchange(&config.amqp.exchange).await?;
    pool.declare_queue(&queue, &config.amqp.exchange, &config.amqp.pubsub_routing_key)
        .await?;

    let (channel, source) = pool.consume(&queue, config.amqp.prefetch).await?;

    let pipeline = HandlerPipeline::builder()
        .post(LogMessages)
        .post(DeliverToListener::new(Arc::new(TapListener)))
        .build();

    let mut ctx = MessageContext::new(CarryType::Consume, config.client.app_id.clone())
        .with_channel(channel);
    ctx.source_node = Some(queue.clone());

    let mut event_loop = ReceiveEventLoop::new(source, ctx, pipeline, Arc::new(ClosingDestroyer));
    event_loop.start_event_loop()?;

    info!(queue = %queue, app_id = %config.client.app_id, "messagebus-tap started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
        }
        _ = event_loop.join() => {
            error!("Receive event loop exited");
        }
    }

    event_loop.shutdown().await;
    event_loop.join().await;
    pool.close();

    Ok(())
}
