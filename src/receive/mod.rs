//! Receive event loop.
//!
//! One [`ReceiveEventLoop`] owns one consumer and one background task. The
//! task parks on [`DeliverySource::next_delivery`] and, for each delivery:
//!
//! 1. acks it on the loop's channel (manual ack, before anything else)
//! 2. drops it with an error log if the type tag is missing or empty
//! 3. resolves the tag; an unknown tag is fatal to the loop
//! 4. decodes header and body
//! 5. stores the message as the context's `consumed_msg`
//! 6. runs the POST segment of a fresh handler chain over a fresh context
//!
//! Acking first bounds redelivery: a delivery that later fails to decode is
//! gone from the broker's point of view. Any error escaping a cycle (unknown
//! type, decode failure, ack failure, handler failure, consumer stream end)
//! is logged and shuts the whole loop down. A shutdown signal is not an
//! error; the task observes it only while waiting for the next delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

use crate::broker::{BrokerChannel, BrokerError, ChannelDestroyer, Delivery, DeliverySource};
use crate::context::MessageContext;
use crate::error::{BusError, Result};
use crate::handler::{HandlerChain, HandlerPipeline};
use crate::message::{Message, MessageType};

/// Lifecycle of a [`ReceiveEventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Running,
    Closed,
}

/// State shared between the loop handle and its task.
struct LoopShared {
    closed: AtomicBool,
    cancel: watch::Sender<bool>,
    channel: Option<Arc<dyn BrokerChannel>>,
    destroyer: Arc<dyn ChannelDestroyer>,
}

impl LoopShared {
    /// Release the channel, then signal the task. Runs at most once.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = &self.channel {
            self.destroyer.destroy(Arc::clone(channel)).await;
        }
        self.cancel.send_replace(true);
        info!("Receive event loop shut down");
    }
}

/// Everything the background task needs, held until the loop is started.
struct Worker {
    source: Box<dyn DeliverySource>,
    template: MessageContext,
    pipeline: Arc<HandlerPipeline>,
    shared: Arc<LoopShared>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!(app_id = %self.template.app_id, "Receive event loop started");

        loop {
            let next = tokio::select! {
                biased;
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        info!(
                            app_id = %self.template.app_id,
                            "Close the consumer's message handler"
                        );
                        break;
                    }
                    continue;
                }
                next = self.source.next_delivery() => next,
            };

            let outcome = match next {
                Some(Ok(delivery)) => {
                    let span = tracing::info_span!(
                        "bus.consume",
                        delivery_tag = delivery.envelope.delivery_tag,
                        routing_key = %delivery.envelope.routing_key
                    );
                    self.process(delivery).instrument(span).await
                }
                Some(Err(e)) => Err(e.into()),
                None => Err(BrokerError::Closed("consumer cancelled by broker".to_string()).into()),
            };

            if let Err(e) = outcome {
                error!(app_id = %self.template.app_id, error = %e, "Receive event loop failed");
                self.shared.shutdown().await;
                break;
            }
        }

        info!(app_id = %self.template.app_id, "Quit from message receiver");
    }

    async fn process(&mut self, delivery: Delivery) -> Result<()> {
        let channel = self
            .template
            .channel
            .as_ref()
            .ok_or(BrokerError::NoChannel)?;
        let delivery_tag = delivery.envelope.delivery_tag;
        channel.ack(delivery_tag, false).await?;

        let Some(type_tag) = delivery.properties.type_tag() else {
            error!(delivery_tag, "Message type is null or empty, dropping delivery");
            return Ok(());
        };

        let message_type = MessageType::lookup(type_tag)?;
        let message = Message::decode(message_type, &delivery.properties, &delivery.body)?;

        let mut ctx = self.template.clone();
        ctx.set_consumed_msg(message);
        ctx.set_consumed_body_len(delivery.body.len());

        let mut chain = HandlerChain::new(Arc::clone(&self.pipeline));
        chain.start_post();
        chain.handle(&mut ctx).await?;

        Ok(())
    }
}

/// Consumer event loop driving the POST pipeline for every delivery.
///
/// ```ignore
/// let ctx = MessageContext::new(CarryType::Consume, "orders").with_channel(channel);
/// let mut event_loop = ReceiveEventLoop::new(source, ctx, pipeline, destroyer);
/// event_loop.start_event_loop()?;
/// // ...
/// event_loop.shutdown().await;
/// ```
pub struct ReceiveEventLoop {
    shared: Arc<LoopShared>,
    worker: Option<Worker>,
    task: Option<JoinHandle<()>>,
}

impl ReceiveEventLoop {
    /// Create a loop in the `Created` state.
    ///
    /// `context` is the template cloned for every delivery; its channel is the
    /// one deliveries are acked on and the one `destroyer` releases on shutdown.
    pub fn new(
        source: impl DeliverySource + 'static,
        context: MessageContext,
        pipeline: Arc<HandlerPipeline>,
        destroyer: Arc<dyn ChannelDestroyer>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shared = Arc::new(LoopShared {
            closed: AtomicBool::new(false),
            cancel: cancel_tx,
            channel: context.channel.clone(),
            destroyer,
        });
        let worker = Worker {
            source: Box::new(source),
            template: context,
            pipeline,
            shared: Arc::clone(&shared),
            cancel: cancel_rx,
        };
        Self {
            shared,
            worker: Some(worker),
            task: None,
        }
    }

    /// Spawn the consumer task. Must be called within a tokio runtime.
    pub fn start_event_loop(&mut self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::InvalidState("event loop is closed".to_string()));
        }
        if self.worker.as_ref().is_some_and(|w| w.template.channel.is_none()) {
            return Err(BrokerError::NoChannel.into());
        }
        let worker = self.worker.take().ok_or(BusError::AlreadyStarted)?;
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Release the channel and stop the task. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }

    /// True while the task is running and the loop has not been shut down.
    pub fn is_alive(&self) -> bool {
        let running = self.task.as_ref().is_some_and(|task| !task.is_finished());
        running && !self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        if self.shared.closed.load(Ordering::SeqCst) {
            return LoopState::Closed;
        }
        match &self.task {
            Some(task) if task.is_finished() => LoopState::Closed,
            Some(_) => LoopState::Running,
            None if self.worker.is_some() => LoopState::Created,
            None => LoopState::Closed,
        }
    }

    /// Wait for the task to exit. Returns immediately if it was never started.
    ///
    /// Cancel-safe: the task handle is only dropped once the task has exited,
    /// so a `join` abandoned in a `select!` can be awaited again.
    pub async fn join(&mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        let outcome = task.await;
        self.task = None;
        if let Err(e) = outcome {
            error!(error = %e, "Receive event loop task panicked");
        }
    }
}

impl Drop for ReceiveEventLoop {
    fn drop(&mut self) {
        self.shared.cancel.send_replace(true);
    }
}
