//! Lifecycle scenarios against the in-memory broker.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use letterbox::channel::inmemory::{ChannelOp, InMemoryBroker};
use letterbox::{
    Consumer, ConsumerConfig, ConsumerErrorKind, Flow, Handler, Letter, Middleware, RawDelivery,
};
use tokio::{sync::Notify, time::sleep};

const SETTLE: Duration = Duration::from_millis(20);

fn delivery(tag: u64, body: &[u8]) -> RawDelivery {
    RawDelivery {
        delivery_tag: tag,
        body: body.to_vec(),
        ..RawDelivery::default()
    }
}

fn replyable(tag: u64, body: &[u8]) -> RawDelivery {
    let mut raw = delivery(tag, body);
    raw.properties.reply_to = Some("reply-queue".into());
    raw.properties.correlation_id = Some("corr-1".into());
    raw
}

fn acks(records: &[ChannelOp]) -> Vec<&ChannelOp> {
    records
        .iter()
        .filter(|op| matches!(op, ChannelOp::Ack { .. }))
        .collect()
}

/// Relies on `auto_ack`; never settles the letter itself.
struct Passive;

#[async_trait::async_trait]
impl Handler for Passive {
    async fn handle(&self, _letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        Ok(None)
    }
}

/// Acks explicitly.
struct Settling;

#[async_trait::async_trait]
impl Handler for Settling {
    async fn handle(&self, letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        letter.ack().await;
        Ok(None)
    }
}

/// Returns a reply payload without settling.
struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    async fn handle(&self, _letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        Ok(Some(b"pong".to_vec()))
    }
}

/// Always fails.
struct Failing;

#[async_trait::async_trait]
impl Handler for Failing {
    async fn handle(&self, _letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        Err("boom".into())
    }
}

/// Holds the letter until released, then acks.
struct Held {
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl Handler for Held {
    async fn handle(&self, letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        self.release.notified().await;
        letter.ack().await;
        Ok(None)
    }
}

/// Records whether it ran.
struct Probe {
    called: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Handler for Probe {
    async fn handle(&self, _letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        self.called.store(true, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn reestablishes_when_the_channel_closes() {
    let broker = InMemoryBroker::default();
    let config = ConsumerConfig::new("orders");
    let consumer = Consumer::subscribe(Passive, broker.clone(), config)
        .await
        .unwrap();
    assert_eq!(broker.consume_calls().await, 1);

    broker.close_channel().await;
    sleep(SETTLE).await;

    assert_eq!(broker.consume_calls().await, 2);
    let records = broker.records().await;
    // Setup order repeats per incarnation: prefetch, then consume, with the
    // same queue both times.
    assert_eq!(
        records,
        vec![
            ChannelOp::Prefetch {
                channel: 1,
                count: 0
            },
            ChannelOp::Consume {
                channel: 1,
                queue: "orders".into()
            },
            ChannelOp::Prefetch {
                channel: 2,
                count: 0
            },
            ChannelOp::Consume {
                channel: 2,
                queue: "orders".into()
            },
        ]
    );

    consumer.close().await;
}

#[tokio::test]
async fn failed_reestablishment_is_terminal_and_reported_once() {
    let broker = InMemoryBroker::default();
    let mut consumer = Consumer::subscribe(Passive, broker.clone(), ConsumerConfig::new("orders"))
        .await
        .unwrap();

    broker.fail_next_consume().await;
    broker.close_channel().await;
    sleep(SETTLE).await;

    let error = consumer.errors().try_recv().unwrap();
    assert!(error.is_terminal());
    assert!(matches!(error.kind(), ConsumerErrorKind::Reestablish(_)));
    assert!(consumer.errors().try_recv().is_err());

    // One attempt only: no third consume call happens later.
    assert_eq!(broker.consume_calls().await, 2);
    assert!(consumer.is_terminated());
}

#[tokio::test]
async fn channel_loss_is_terminal_when_reestablishment_is_disabled() {
    let broker = InMemoryBroker::default();
    let mut config = ConsumerConfig::new("orders");
    config.reestablish = false;
    let mut consumer = Consumer::subscribe(Passive, broker.clone(), config)
        .await
        .unwrap();

    broker.close_channel().await;
    sleep(SETTLE).await;

    assert_eq!(broker.consume_calls().await, 1);
    let error = consumer.errors().try_recv().unwrap();
    assert!(error.is_terminal());
    assert!(matches!(error.kind(), ConsumerErrorKind::ChannelLost));
    assert!(consumer.errors().try_recv().is_err());
    assert!(consumer.is_terminated());
}

#[tokio::test]
async fn auto_ack_settles_unhandled_letters_exactly_once() {
    let broker = InMemoryBroker::default();
    let mut config = ConsumerConfig::new("orders");
    config.auto_ack = true;
    let consumer = Consumer::subscribe(Passive, broker.clone(), config)
        .await
        .unwrap();

    broker.deliver(delivery(1, b"hello")).await.unwrap();
    sleep(SETTLE).await;

    let records = broker.records().await;
    assert_eq!(
        acks(&records),
        vec![&ChannelOp::Ack {
            channel: 1,
            delivery_tag: 1
        }]
    );

    consumer.close().await;
}

#[tokio::test]
async fn auto_ack_is_a_noop_when_the_handler_already_settled() {
    let broker = InMemoryBroker::default();
    let mut config = ConsumerConfig::new("orders");
    config.auto_ack = true;
    let consumer = Consumer::subscribe(Settling, broker.clone(), config)
        .await
        .unwrap();

    broker.deliver(delivery(4, b"hello")).await.unwrap();
    sleep(SETTLE).await;

    assert_eq!(acks(&broker.records().await).len(), 1);

    consumer.close().await;
}

#[tokio::test]
async fn auto_reply_forwards_the_handler_return_value() {
    let broker = InMemoryBroker::default();
    let mut config = ConsumerConfig::new("rpc");
    config.auto_ack = true;
    config.auto_reply = true;
    let consumer = Consumer::subscribe(Echo, broker.clone(), config)
        .await
        .unwrap();

    broker.deliver(replyable(2, b"ping")).await.unwrap();
    sleep(SETTLE).await;

    let records = broker.records().await;
    let replies: Vec<_> = records
        .iter()
        .filter(|op| matches!(op, ChannelOp::Reply { .. }))
        .collect();
    assert_eq!(
        replies,
        vec![&ChannelOp::Reply {
            channel: 1,
            reply_to: "reply-queue".into(),
            correlation_id: "corr-1".into(),
            payload: b"pong".to_vec(),
        }]
    );
    assert_eq!(acks(&records).len(), 1);

    consumer.close().await;
}

#[tokio::test]
async fn handler_errors_nack_with_requeue_and_keep_the_consumer_running() {
    let broker = InMemoryBroker::default();
    let mut consumer = Consumer::subscribe(Failing, broker.clone(), ConsumerConfig::new("orders"))
        .await
        .unwrap();

    broker.deliver(delivery(1, b"first")).await.unwrap();
    sleep(SETTLE).await;

    let error = consumer.errors().try_recv().unwrap();
    assert!(!error.is_terminal());
    assert!(matches!(error.kind(), ConsumerErrorKind::Handler(_)));

    broker.deliver(delivery(2, b"second")).await.unwrap();
    sleep(SETTLE).await;

    let records = broker.records().await;
    let nacks: Vec<_> = records
        .iter()
        .filter(|op| matches!(op, ChannelOp::Nack { requeue: true, .. }))
        .collect();
    assert_eq!(nacks.len(), 2);
    assert!(!consumer.is_terminated());

    consumer.close().await;
}

#[tokio::test]
async fn decode_failures_are_isolated_per_message() {
    let broker = InMemoryBroker::default();
    let mut config = ConsumerConfig::new("orders");
    config.json = true;
    config.auto_ack = true;
    let mut consumer = Consumer::subscribe(Passive, broker.clone(), config)
        .await
        .unwrap();

    broker.deliver(delivery(1, b"not json")).await.unwrap();
    broker.deliver(delivery(2, br#"{"ok":true}"#)).await.unwrap();
    sleep(SETTLE).await;

    let error = consumer.errors().try_recv().unwrap();
    assert!(matches!(error.kind(), ConsumerErrorKind::Decode(_)));
    assert!(consumer.errors().try_recv().is_err());

    // The bad payload is neither acked nor nacked; the good one is acked.
    let records = broker.records().await;
    assert_eq!(
        acks(&records),
        vec![&ChannelOp::Ack {
            channel: 1,
            delivery_tag: 2
        }]
    );
    assert!(!records
        .iter()
        .any(|op| matches!(op, ChannelOp::Nack { .. })));
    assert!(!consumer.is_terminated());

    consumer.close().await;
}

/// Discards every letter without running the handler.
struct Discard;

#[async_trait::async_trait]
impl Middleware for Discard {
    async fn handle(&self, letter: &mut Letter) -> Flow {
        letter.nack(false).await;
        Flow::Halt
    }
}

#[tokio::test]
async fn middleware_can_short_circuit_dispatch() {
    let broker = InMemoryBroker::default();
    let called = Arc::new(AtomicBool::new(false));
    let mut config = ConsumerConfig::new("orders");
    config.middleware = vec![Arc::new(Discard)];
    let consumer = Consumer::subscribe(
        Probe {
            called: Arc::clone(&called),
        },
        broker.clone(),
        config,
    )
    .await
    .unwrap();

    broker.deliver(delivery(9, b"payload")).await.unwrap();
    sleep(SETTLE).await;

    assert!(!called.load(Ordering::SeqCst));
    let records = broker.records().await;
    assert!(records.contains(&ChannelOp::Nack {
        channel: 1,
        delivery_tag: 9,
        requeue: false
    }));

    consumer.close().await;
}

/// Logs its label together with the letter's nacked state, nacking when told
/// to so the following stages see the change.
struct Stamping {
    label: &'static str,
    nack: bool,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Middleware for Stamping {
    async fn handle(&self, letter: &mut Letter) -> Flow {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, letter.is_nacked()));
        if self.nack {
            letter.nack(false).await;
        }
        Flow::Continue
    }
}

/// Records the letter's nacked state as seen from the handler.
struct NackedProbe {
    nacked: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Handler for NackedProbe {
    async fn handle(&self, letter: &mut Letter) -> Result<Option<Vec<u8>>, tower::BoxError> {
        self.nacked.store(letter.is_nacked(), Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn middleware_stages_run_in_order_and_see_earlier_changes() {
    let broker = InMemoryBroker::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler_saw_nacked = Arc::new(AtomicBool::new(false));

    let mut config = ConsumerConfig::new("orders");
    config.middleware = vec![
        Arc::new(Stamping {
            label: "first",
            nack: true,
            log: Arc::clone(&log),
        }),
        Arc::new(Stamping {
            label: "second",
            nack: false,
            log: Arc::clone(&log),
        }),
    ];
    let consumer = Consumer::subscribe(
        NackedProbe {
            nacked: Arc::clone(&handler_saw_nacked),
        },
        broker.clone(),
        config,
    )
    .await
    .unwrap();

    broker.deliver(delivery(11, b"payload")).await.unwrap();
    sleep(SETTLE).await;

    // The first stage runs on an unsettled letter; the second stage and the
    // handler both see the nack it applied.
    assert_eq!(
        *log.lock().unwrap(),
        vec!["first:false".to_owned(), "second:true".to_owned()]
    );
    assert!(handler_saw_nacked.load(Ordering::SeqCst));

    consumer.close().await;
}

#[tokio::test]
async fn late_settlement_targets_the_original_channel_incarnation() {
    let broker = InMemoryBroker::default();
    let release = Arc::new(Notify::new());
    let consumer = Consumer::subscribe(
        Held {
            release: Arc::clone(&release),
        },
        broker.clone(),
        ConsumerConfig::new("orders"),
    )
    .await
    .unwrap();

    broker.deliver(delivery(7, b"slow")).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    broker.close_channel().await;
    sleep(SETTLE).await;
    assert_eq!(broker.consume_calls().await, 2);

    release.notify_one();
    sleep(SETTLE).await;

    // The ack lands on incarnation 1 even though incarnation 2 is active.
    let records = broker.records().await;
    assert_eq!(
        acks(&records),
        vec![&ChannelOp::Ack {
            channel: 1,
            delivery_tag: 7
        }]
    );

    consumer.close().await;
}

#[tokio::test]
async fn close_waits_for_in_flight_letters_before_cancelling() {
    let broker = InMemoryBroker::default();
    let release = Arc::new(Notify::new());
    let mut config = ConsumerConfig::new("orders");
    config.grace = Duration::from_secs(1);
    let consumer = Consumer::subscribe(
        Held {
            release: Arc::clone(&release),
        },
        broker.clone(),
        config,
    )
    .await
    .unwrap();

    broker.deliver(delivery(3, b"slow")).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let closing = tokio::spawn(consumer.close());
    sleep(Duration::from_millis(10)).await;
    assert!(!closing.is_finished());

    release.notify_one();
    closing.await.unwrap();

    let records = broker.records().await;
    let ack_position = records
        .iter()
        .position(|op| matches!(op, ChannelOp::Ack { .. }))
        .unwrap();
    let cancel_position = records
        .iter()
        .position(|op| matches!(op, ChannelOp::Cancel { .. }))
        .unwrap();
    assert!(ack_position < cancel_position);
    assert!(records.contains(&ChannelOp::Cancel {
        channel: 1,
        consumer_tag: "ctag-1".into()
    }));
}

#[tokio::test]
async fn close_gives_up_after_the_grace_period() {
    let broker = InMemoryBroker::default();
    let release = Arc::new(Notify::new());
    let mut config = ConsumerConfig::new("orders");
    config.grace = Duration::from_millis(30);
    let consumer = Consumer::subscribe(
        Held {
            release: Arc::clone(&release),
        },
        broker.clone(),
        config,
    )
    .await
    .unwrap();

    broker.deliver(delivery(5, b"stuck")).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    consumer.close().await;

    let records = broker.records().await;
    assert!(records
        .iter()
        .any(|op| matches!(op, ChannelOp::Cancel { .. })));
    assert!(acks(&records).is_empty());
}

#[tokio::test]
async fn setup_hook_runs_on_every_incarnation() {
    use letterbox::{Channel, ChannelSetup};
    use std::sync::atomic::AtomicUsize;

    struct CountingSetup {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ChannelSetup for CountingSetup {
        async fn setup(&self, _channel: &dyn Channel) -> Result<(), tower::BoxError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let broker = InMemoryBroker::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut config = ConsumerConfig::new("orders");
    config.setup = Some(Arc::new(CountingSetup {
        runs: Arc::clone(&runs),
    }));
    let consumer = Consumer::subscribe(Passive, broker.clone(), config)
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    broker.close_channel().await;
    sleep(SETTLE).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    consumer.close().await;
}
