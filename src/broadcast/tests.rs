use super::*;
use std::time::Duration;

use crate::broker::{MemoryBroker, MemoryPool};
use crate::handler::{AcquireChannel, DeliverToListener, MessageHandler};
use crate::message::{MessageType, Notice, NoticeLevel};
use crate::receive::ReceiveEventLoop;
use crate::test_utils::{
    call_log, CallLog, CollectingListener, CountingDestroyer, RecordingChannel, RecordingHandler,
    StaticPool,
};

struct Rig {
    broadcaster: Broadcaster,
    channel: Arc<RecordingChannel>,
    destroyer: Arc<CountingDestroyer>,
    pool: Arc<StaticPool>,
    state: Arc<ClientState>,
}

fn resolver() -> Arc<dyn AddressResolver> {
    let mut nodes = BTreeMap::new();
    nodes.insert("app-1".to_string(), "queue.app-1".to_string());
    Arc::new(StaticAddressResolver::new(nodes))
}

fn rig_with(log: CallLog, pipeline: Arc<HandlerPipeline>) -> Rig {
    let channel = Arc::new(RecordingChannel::with_log(5, log));
    let destroyer = Arc::new(CountingDestroyer::new());
    let pool = Arc::new(StaticPool::new(channel.clone(), destroyer.clone()));
    let state = Arc::new(ClientState::open());

    let carrier = CarrierContext::new("app-1").with_pool(pool.clone());
    let broadcaster = Broadcaster::new(carrier, pipeline, resolver(), state.clone());

    Rig {
        broadcaster,
        channel,
        destroyer,
        pool,
        state,
    }
}

fn rig() -> Rig {
    rig_with(
        call_log(),
        HandlerPipeline::builder().pre(AcquireChannel).build(),
    )
}

#[tokio::test]
async fn test_publishes_every_message_in_order() {
    let rig = rig();
    let messages = vec![
        Message::text("one"),
        Message::app(vec![1, 2, 3]),
        Message::heartbeat(),
    ];

    rig.broadcaster.broadcast(messages.clone()).await.unwrap();

    let publishes = rig.channel.publishes().await;
    assert_eq!(publishes.len(), 3);
    for (record, msg) in publishes.iter().zip(&messages) {
        assert_eq!(record.exchange, PROXY_EXCHANGE_NAME);
        assert_eq!(record.routing_key, PUBSUB_ROUTING_KEY);
        let (properties, body) = msg.encode().unwrap();
        assert_eq!(record.properties, properties);
        assert_eq!(record.body, body);
    }
    assert_eq!(rig.destroyer.destroyed().await, vec![5]);
}

#[tokio::test]
async fn test_pre_publish_release_post_ordering() {
    let log = call_log();
    let pipeline = HandlerPipeline::builder()
        .pre(AcquireChannel)
        .pre(RecordingHandler::new("pre", log.clone()))
        .post(RecordingHandler::new("post", log.clone()))
        .build();
    let rig = rig_with(log.clone(), pipeline);

    rig.broadcaster
        .broadcast(vec![Message::text("a"), Message::text("b")])
        .await
        .unwrap();

    assert_eq!(
        *log.read().await,
        vec!["pre", "publish:0", "publish:1", "post"]
    );
    assert_eq!(rig.destroyer.count(), 1);
}

#[tokio::test]
async fn test_publish_failure_aborts_rest_and_releases_once() {
    let log = call_log();
    let pipeline = HandlerPipeline::builder()
        .pre(AcquireChannel)
        .post(RecordingHandler::new("post", log.clone()))
        .build();
    let rig = rig_with(log.clone(), pipeline);
    rig.channel.fail_publish_at(0).await;

    let result = rig
        .broadcaster
        .broadcast(vec![Message::text("m1"), Message::text("m2")])
        .await;

    assert!(result.is_ok());
    assert_eq!(rig.channel.publish_attempts(), 1);
    assert!(rig.channel.publishes().await.is_empty());
    assert_eq!(rig.destroyer.count(), 1);
    assert_eq!(*log.read().await, vec!["publish:0", "post"]);
}

#[tokio::test]
async fn test_failure_midway_keeps_earlier_publishes() {
    let rig = rig();
    rig.channel.fail_publish_at(1).await;

    rig.broadcaster
        .broadcast(vec![
            Message::text("m0"),
            Message::text("m1"),
            Message::text("m2"),
        ])
        .await
        .unwrap();

    let publishes = rig.channel.publishes().await;
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0].body, b"m0");
    assert_eq!(rig.channel.publish_attempts(), 2);
    assert_eq!(rig.destroyer.count(), 1);
}

#[tokio::test]
async fn test_closed_client_fails_fast() {
    let rig = rig();
    rig.state.close();

    let err = rig
        .broadcaster
        .broadcast(vec![Message::text("x")])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::InvalidState(_)));
    assert_eq!(rig.pool.acquired(), 0);
    assert_eq!(rig.channel.publish_attempts(), 0);
    assert_eq!(rig.destroyer.count(), 0);
}

#[tokio::test]
async fn test_closed_connection_fails_fast() {
    let broker = MemoryBroker::new();
    broker.close();
    let channel = Arc::new(RecordingChannel::new(1));
    let destroyer = Arc::new(CountingDestroyer::new());
    let pool = Arc::new(StaticPool::new(channel.clone(), destroyer));
    let carrier = CarrierContext::new("app-1")
        .with_pool(pool.clone())
        .with_connection(Arc::new(broker));
    let broadcaster = Broadcaster::new(
        carrier,
        HandlerPipeline::builder().pre(AcquireChannel).build(),
        resolver(),
        Arc::new(ClientState::open()),
    );

    let err = broadcaster
        .broadcast(vec![Message::text("x")])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::InvalidState(_)));
    assert_eq!(pool.acquired(), 0);
}

#[tokio::test]
async fn test_empty_batch_runs_handlers_without_publishing() {
    let log = call_log();
    let pipeline = HandlerPipeline::builder()
        .pre(AcquireChannel)
        .pre(RecordingHandler::new("pre", log.clone()))
        .post(RecordingHandler::new("post", log.clone()))
        .build();
    let rig = rig_with(log.clone(), pipeline);

    rig.broadcaster.broadcast(Vec::new()).await.unwrap();

    assert_eq!(rig.channel.publish_attempts(), 0);
    assert_eq!(rig.pool.acquired(), 1);
    assert_eq!(rig.destroyer.count(), 1);
    assert_eq!(*log.read().await, vec!["pre", "post"]);
}

#[tokio::test]
async fn test_unencodable_timestamp_is_rejected_before_publish() {
    let rig = rig();
    let mut late = Message::text("late");
    late.header_mut().timestamp =
        Some(chrono::DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap());

    let err = rig
        .broadcaster
        .broadcast(vec![Message::text("fine"), late])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::InvalidMessage(ref m) if m.starts_with("message 1")));
    assert_eq!(rig.pool.acquired(), 0);
    assert_eq!(rig.channel.publish_attempts(), 0);
}

#[tokio::test]
async fn test_invalid_message_is_rejected_before_publish() {
    let rig = rig();
    let broken = Message::new(MessageType::TextMessage);

    let err = rig
        .broadcaster
        .broadcast(vec![Message::text("fine"), broken])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::InvalidMessage(ref m) if m.starts_with("message 1")));
    assert_eq!(rig.channel.publish_attempts(), 0);
}

#[tokio::test]
async fn test_pre_failure_releases_channel_and_propagates() {
    let log = call_log();
    let pipeline = HandlerPipeline::builder()
        .pre(AcquireChannel)
        .pre(RecordingHandler::failing("deny", log.clone()))
        .post(RecordingHandler::new("post", log.clone()))
        .build();
    let rig = rig_with(log.clone(), pipeline);

    let err = rig
        .broadcaster
        .broadcast(vec![Message::text("x")])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::Handler(_)));
    assert_eq!(rig.channel.publish_attempts(), 0);
    assert_eq!(rig.destroyer.count(), 1);
    assert_eq!(*log.read().await, vec!["deny"]);
}

#[tokio::test]
async fn test_missing_channel_is_returned_and_skips_post() {
    let log = call_log();
    let pipeline = HandlerPipeline::builder()
        .post(RecordingHandler::new("post", log.clone()))
        .build();
    let rig = rig_with(log.clone(), pipeline);

    let err = rig
        .broadcaster
        .broadcast(vec![Message::text("x")])
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::Broker(BrokerError::NoChannel)));
    assert_eq!(rig.channel.publish_attempts(), 0);
    assert_eq!(rig.destroyer.count(), 0);
    assert!(log.read().await.is_empty());
}

/// Records the resolved source node seen by PRE handlers.
struct SourceNodeRecorder {
    seen: CallLog,
}

#[async_trait::async_trait]
impl MessageHandler for SourceNodeRecorder {
    fn name(&self) -> &str {
        "source-node-recorder"
    }

    async fn handle(
        &self,
        ctx: &mut MessageContext,
    ) -> std::result::Result<crate::handler::HandlerFlow, crate::handler::HandlerError> {
        let node = ctx.source_node.clone().unwrap_or_default();
        self.seen
            .write()
            .await
            .push(format!("{:?}:{}", ctx.carry_type, node));
        Ok(crate::handler::HandlerFlow::Continue)
    }
}

#[tokio::test]
async fn test_context_carries_resolved_source_node() {
    let seen = call_log();
    let pipeline = HandlerPipeline::builder()
        .pre(AcquireChannel)
        .pre(SourceNodeRecorder { seen: seen.clone() })
        .build();
    let rig = rig_with(call_log(), pipeline);

    rig.broadcaster
        .broadcast(vec![Message::heartbeat()])
        .await
        .unwrap();

    assert_eq!(*seen.read().await, vec!["Broadcast:queue.app-1"]);
}

#[tokio::test]
async fn test_custom_route() {
    let rig = rig();
    let broadcaster = rig.broadcaster.with_route("exchange.custom", "rk.custom");
    assert_eq!(broadcaster.exchange(), "exchange.custom");

    broadcaster.broadcast(vec![Message::text("x")]).await.unwrap();

    let publishes = rig.channel.publishes().await;
    assert_eq!(publishes[0].exchange, "exchange.custom");
    assert_eq!(publishes[0].routing_key, "rk.custom");
}

#[tokio::test]
async fn test_broadcast_reaches_receive_loop_through_memory_broker() {
    let broker = MemoryBroker::new();
    let source = broker.declare_queue("queue.app-2").await;
    broker
        .bind("queue.app-2", PROXY_EXCHANGE_NAME, PUBSUB_ROUTING_KEY)
        .await;

    let (listener, mut received) = CollectingListener::new();
    let consumer_channel = broker.open_channel().await.unwrap();
    let consumer_ctx = MessageContext::new(CarryType::Consume, "app-2")
        .with_channel(consumer_channel.clone());
    let mut event_loop = ReceiveEventLoop::new(
        source,
        consumer_ctx,
        HandlerPipeline::builder()
            .post(DeliverToListener::new(listener))
            .build(),
        Arc::new(broker.clone()),
    );
    event_loop.start_event_loop().unwrap();

    let pool: Arc<dyn ChannelPool> = Arc::new(MemoryPool::new(broker.clone()));
    let carrier = CarrierContext::new("app-1")
        .with_pool(pool)
        .with_connection(Arc::new(broker.clone()));
    let broadcaster = Broadcaster::new(
        carrier,
        HandlerPipeline::builder().pre(AcquireChannel).build(),
        resolver(),
        Arc::new(ClientState::open()),
    );

    let notice = Message::notice(Notice {
        title: "deploy".to_string(),
        content: "v2 rolled out".to_string(),
        level: NoticeLevel::Info,
    });
    let sent = vec![Message::text("hello"), notice];
    broadcaster.broadcast(sent.clone()).await.unwrap();

    for expected in &sent {
        let got = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("timed out waiting for broadcast")
            .expect("listener closed");
        assert_eq!(got.message_type(), expected.message_type());
        assert_eq!(got.body(), expected.body());
    }

    // broadcast channel released, consumer channel still open
    assert_eq!(broker.open_channel_count().await, 1);
    assert_eq!(broker.acks().await.len(), 2);

    event_loop.shutdown().await;
    event_loop.join().await;
    assert_eq!(broker.open_channel_count().await, 0);
}
