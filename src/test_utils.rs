//! Test utilities and mock implementations.
//!
//! Mocks of the broker seam and handler traits for exercising the receive
//! loop and send path without a running broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::broker::{
    BrokerChannel, BrokerError, ChannelDestroyer, ChannelPool, Delivery, DeliverySource, Envelope,
    Result as BrokerResult,
};
use crate::context::MessageContext;
use crate::handler::{HandlerError, HandlerFlow, MessageHandler, MessageListener};
use crate::message::{Message, WireProperties};

/// Shared, ordered log of labelled events.
pub type CallLog = Arc<RwLock<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(RwLock::new(Vec::new()))
}

/// One observed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: WireProperties,
}

/// Channel that records acks and publishes, with publish failure injection.
pub struct RecordingChannel {
    id: u16,
    log: CallLog,
    acks: RwLock<Vec<(u64, bool)>>,
    publishes: RwLock<Vec<PublishRecord>>,
    publish_attempts: AtomicUsize,
    fail_publish_at: RwLock<HashSet<usize>>,
    fail_acks: RwLock<bool>,
}

impl RecordingChannel {
    pub fn new(id: u16) -> Self {
        Self::with_log(id, call_log())
    }

    /// Channel that also appends `ack:<tag>` / `publish:<n>` to `log`.
    pub fn with_log(id: u16, log: CallLog) -> Self {
        Self {
            id,
            log,
            acks: RwLock::new(Vec::new()),
            publishes: RwLock::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            fail_publish_at: RwLock::new(HashSet::new()),
            fail_acks: RwLock::new(false),
        }
    }

    /// Make the publish attempt with zero-based index `attempt` fail.
    pub async fn fail_publish_at(&self, attempt: usize) {
        self.fail_publish_at.write().await.insert(attempt);
    }

    pub async fn set_fail_acks(&self, fail: bool) {
        *self.fail_acks.write().await = fail;
    }

    pub async fn acks(&self) -> Vec<(u64, bool)> {
        self.acks.read().await.clone()
    }

    pub async fn publishes(&self) -> Vec<PublishRecord> {
        self.publishes.read().await.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    fn id(&self) -> u16 {
        self.id
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> BrokerResult<()> {
        if *self.fail_acks.read().await {
            return Err(BrokerError::Ack("mock ack failure".to_string()));
        }
        self.acks.write().await.push((delivery_tag, multiple));
        self.log.write().await.push(format!("ack:{}", delivery_tag));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &WireProperties,
    ) -> BrokerResult<()> {
        let attempt = self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.log.write().await.push(format!("publish:{}", attempt));
        if self.fail_publish_at.read().await.contains(&attempt) {
            return Err(BrokerError::Publish("mock publish failure".to_string()));
        }
        self.publishes.write().await.push(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }
}

/// Destroyer that counts releases.
#[derive(Default)]
pub struct CountingDestroyer {
    count: AtomicUsize,
    destroyed: RwLock<Vec<u16>>,
}

impl CountingDestroyer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn destroyed(&self) -> Vec<u16> {
        self.destroyed.read().await.clone()
    }
}

#[async_trait]
impl ChannelDestroyer for CountingDestroyer {
    async fn destroy(&self, channel: Arc<dyn BrokerChannel>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.destroyed.write().await.push(channel.id());
    }
}

/// Pool that always hands out the same channel.
pub struct StaticPool {
    channel: Arc<RecordingChannel>,
    destroyer: Arc<CountingDestroyer>,
    acquired: AtomicUsize,
}

impl StaticPool {
    pub fn new(channel: Arc<RecordingChannel>, destroyer: Arc<CountingDestroyer>) -> Self {
        Self {
            channel,
            destroyer,
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelPool for StaticPool {
    async fn acquire(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let channel: Arc<dyn BrokerChannel> = self.channel.clone();
        Ok(channel)
    }

    fn destroyer(&self) -> Arc<dyn ChannelDestroyer> {
        self.destroyer.clone()
    }
}

/// Delivery source fed by the test through an unbounded sender.
///
/// Dropping the sender ends the stream.
pub struct ScriptedSource {
    receiver: mpsc::UnboundedReceiver<BrokerResult<Delivery>>,
}

impl ScriptedSource {
    pub fn new() -> (mpsc::UnboundedSender<BrokerResult<Delivery>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { receiver: rx })
    }
}

#[async_trait]
impl DeliverySource for ScriptedSource {
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        self.receiver.recv().await
    }
}

/// Raw delivery with an optional type tag.
pub fn raw_delivery(delivery_tag: u64, kind: Option<&str>, body: &[u8]) -> Delivery {
    Delivery {
        properties: WireProperties {
            kind: kind.map(str::to_string),
            ..Default::default()
        },
        body: body.to_vec(),
        envelope: Envelope {
            delivery_tag,
            ..Default::default()
        },
    }
}

/// Delivery carrying an encoded message.
pub fn message_delivery(delivery_tag: u64, message: &Message) -> Delivery {
    let (properties, body) = message.encode().expect("test message must encode");
    Delivery {
        properties,
        body,
        envelope: Envelope {
            delivery_tag,
            ..Default::default()
        },
    }
}

/// Handler that records its label, then continues, stops or fails.
pub struct RecordingHandler {
    label: String,
    log: CallLog,
    flow: HandlerFlow,
    fail: bool,
}

impl RecordingHandler {
    pub fn new(label: impl Into<String>, log: CallLog) -> Self {
        Self {
            label: label.into(),
            log,
            flow: HandlerFlow::Continue,
            fail: false,
        }
    }

    pub fn stopping(label: impl Into<String>, log: CallLog) -> Self {
        Self {
            flow: HandlerFlow::Stop,
            ..Self::new(label, log)
        }
    }

    pub fn failing(label: impl Into<String>, log: CallLog) -> Self {
        Self {
            fail: true,
            ..Self::new(label, log)
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.label
    }

    async fn handle(&self, _ctx: &mut MessageContext) -> Result<HandlerFlow, HandlerError> {
        self.log.write().await.push(self.label.clone());
        if self.fail {
            return Err(HandlerError::Failed {
                handler: self.label.clone(),
                reason: "mock handler failure".to_string(),
            });
        }
        Ok(self.flow)
    }
}

/// Listener forwarding every consumed message to a channel.
pub struct CollectingListener {
    sender: mpsc::UnboundedSender<Message>,
}

impl CollectingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { sender: tx }), rx)
    }
}

#[async_trait]
impl MessageListener for CollectingListener {
    async fn on_message(
        &self,
        message: &Message,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let _ = self.sender.send(message.clone());
        Ok(())
    }
}
