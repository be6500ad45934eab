//! AMQP (RabbitMQ) transport via lapin.
//!
//! Connections come from a deadpool-lapin pool. The send path gets a fresh
//! channel per broadcast from [`AmqpPool`]; consumers get a dedicated channel
//! with manual acks and a prefetch limit.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerError, ChannelDestroyer, ChannelPool, Delivery,
    DeliverySource, Envelope, Result,
};
use crate::message::{HeaderValue, WireProperties};

/// Reply code sent when closing a channel normally.
const REPLY_SUCCESS: u16 = 200;

/// A lapin channel behind the [`BrokerChannel`] seam.
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &WireProperties,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(format!("Confirm failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "released")
            .await
            .map_err(|e| BrokerError::Closed(e.to_string()))
    }
}

/// Destroyer that closes channels on the broker.
#[derive(Debug, Default)]
pub struct ClosingDestroyer;

#[async_trait]
impl ChannelDestroyer for ClosingDestroyer {
    async fn destroy(&self, channel: Arc<dyn BrokerChannel>) {
        let id = channel.id();
        match channel.close().await {
            Ok(()) => debug!(channel = id, "Closed channel"),
            Err(e) => warn!(channel = id, error = %e, "Failed to close channel"),
        }
    }
}

/// Pooled AMQP connections.
#[derive(Clone)]
pub struct AmqpPool {
    pool: Pool,
    url: String,
}

impl AmqpPool {
    /// Build the pool and verify that a connection can be established.
    pub async fn connect(url: impl Into<String>, max_size: usize) -> Result<Self> {
        let url = url.into();
        let manager = Manager::new(url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        let amqp = Self { pool, url };
        amqp.open_channel().await?.close().await?;
        info!(url = %amqp.url, "Connected to AMQP");
        Ok(amqp)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the pool. Channels already handed out stay usable until their
    /// connection drops.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        Ok(AmqpChannel::new(channel))
    }

    /// Declare the durable topic exchange broadcasts go through.
    pub async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.open_channel().await?;
        channel
            .inner()
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to declare exchange: {}", e)))?;
        channel.close().await
    }

    /// Declare a durable queue and bind it to `exchange` for `routing_key`.
    pub async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        let channel = self.open_channel().await?;
        channel
            .inner()
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to declare queue: {}", e)))?;

        channel
            .inner()
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        channel.close().await
    }

    /// Start a manual-ack consumer on `queue`.
    ///
    /// Returns the consumer's channel (deliveries must be acked on it) and
    /// the delivery source for a receive loop.
    pub async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<(Arc<AmqpChannel>, AmqpDeliverySource)> {
        let channel = self.open_channel().await?;
        channel
            .inner()
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("messagebus-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .inner()
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer started");
        Ok((Arc::new(channel), AmqpDeliverySource { consumer }))
    }
}

#[async_trait]
impl ChannelPool for AmqpPool {
    async fn acquire(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel: Arc<dyn BrokerChannel> = Arc::new(self.open_channel().await?);
        Ok(channel)
    }

    fn destroyer(&self) -> Arc<dyn ChannelDestroyer> {
        Arc::new(ClosingDestroyer)
    }
}

#[async_trait]
impl BrokerConnection for AmqpPool {
    fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.acquire().await
    }
}

/// Deliveries from one lapin consumer.
pub struct AmqpDeliverySource {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                properties: from_basic_properties(&delivery.properties),
                envelope: Envelope {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                },
                body: delivery.data,
            })
            .map_err(|e| BrokerError::Connection(format!("Consumer delivery error: {}", e))),
        )
    }
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

/// Convert to lapin properties. Unset fields stay unset.
pub fn to_basic_properties(props: &WireProperties) -> BasicProperties {
    let mut out = BasicProperties::default();
    if let Some(v) = &props.kind {
        out = out.with_kind(short(v));
    }
    if let Some(v) = &props.message_id {
        out = out.with_message_id(short(v));
    }
    if let Some(v) = props.timestamp {
        out = out.with_timestamp(v);
    }
    if let Some(v) = props.priority {
        out = out.with_priority(v);
    }
    if let Some(v) = &props.expiration {
        out = out.with_expiration(short(v));
    }
    if let Some(v) = props.delivery_mode {
        out = out.with_delivery_mode(v);
    }
    if let Some(v) = &props.content_type {
        out = out.with_content_type(short(v));
    }
    if let Some(v) = &props.content_encoding {
        out = out.with_content_encoding(short(v));
    }
    if let Some(v) = &props.correlation_id {
        out = out.with_correlation_id(short(v));
    }
    if let Some(v) = &props.reply_to {
        out = out.with_reply_to(short(v));
    }
    if let Some(v) = &props.app_id {
        out = out.with_app_id(short(v));
    }
    if let Some(v) = &props.user_id {
        out = out.with_user_id(short(v));
    }
    if let Some(v) = &props.cluster_id {
        out = out.with_cluster_id(short(v));
    }
    if !props.headers.is_empty() {
        let table: BTreeMap<ShortString, AMQPValue> = props
            .headers
            .iter()
            .map(|(k, v)| (short(k), to_amqp_value(v)))
            .collect();
        out = out.with_headers(FieldTable::from(table));
    }
    out
}

/// Convert from lapin properties. Header values with no [`HeaderValue`]
/// counterpart are dropped.
pub fn from_basic_properties(props: &BasicProperties) -> WireProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_string());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| from_amqp_value(v).map(|v| (k.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    WireProperties {
        kind: text(props.kind()),
        message_id: text(props.message_id()),
        timestamp: *props.timestamp(),
        priority: *props.priority(),
        expiration: text(props.expiration()),
        delivery_mode: *props.delivery_mode(),
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        app_id: text(props.app_id()),
        user_id: text(props.user_id()),
        cluster_id: text(props.cluster_id()),
        headers,
    }
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::Text(s) => AMQPValue::LongString(LongString::from(s.clone())),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongLongInt(i) => Some(HeaderValue::Int(*i)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Text(s.as_str().to_string())),
        AMQPValue::LongString(s) => Some(match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => HeaderValue::Text(text.to_string()),
            Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
        }),
        AMQPValue::ByteArray(b) => Some(HeaderValue::Bytes(b.as_slice().to_vec())),
        _ => None,
    }
}
