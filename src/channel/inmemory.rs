//! In-memory broker for tests and local pipelines.
//!
//! [`InMemoryBroker`] plays the connection manager: every
//! [`channel`](crate::channel::ChannelSource::channel) call produces a new
//! channel incarnation. Each channel operation is recorded together with the
//! incarnation it targeted, which makes acknowledgment routing across
//! reestablishments observable. The broker can also close the active
//! subscription and fail the next consume call, simulating the two channel
//! failures a consumer has to survive.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channel::{Channel, ChannelSource, RawDelivery, Subscription};

/// Shared in-memory broker state, cloneable across tests and consumers.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    incarnations: usize,
    consume_calls: usize,
    fail_next_consume: bool,
    active: Option<ActiveSubscription>,
    records: Vec<ChannelOp>,
}

struct ActiveSubscription {
    incarnation: usize,
    sender: mpsc::UnboundedSender<RawDelivery>,
}

/// One recorded channel operation, tagged with the incarnation (1-based) it
/// was issued on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOp {
    Prefetch {
        channel: usize,
        count: u16,
    },
    Consume {
        channel: usize,
        queue: String,
    },
    Ack {
        channel: usize,
        delivery_tag: u64,
    },
    Nack {
        channel: usize,
        delivery_tag: u64,
        requeue: bool,
    },
    Reply {
        channel: usize,
        reply_to: String,
        correlation_id: String,
        payload: Vec<u8>,
    },
    Cancel {
        channel: usize,
        consumer_tag: String,
    },
}

impl InMemoryBroker {
    /// Push a raw delivery to the active subscription.
    pub async fn deliver(&self, raw: RawDelivery) -> Result<(), tower::BoxError> {
        let state = self.state.lock().await;
        let Some(active) = &state.active else {
            return Err("no active subscription".into());
        };
        active
            .sender
            .send(raw)
            .map_err(|_| tower::BoxError::from("subscription receiver dropped"))
    }

    /// Close the active subscription, ending its delivery stream. The next
    /// thing the consumer observes is channel loss.
    pub async fn close_channel(&self) {
        self.state.lock().await.active.take();
    }

    /// Make the next consume call fail.
    pub async fn fail_next_consume(&self) {
        self.state.lock().await.fail_next_consume = true;
    }

    /// How many times consume has been called, across all incarnations.
    pub async fn consume_calls(&self) -> usize {
        self.state.lock().await.consume_calls
    }

    /// Every channel operation recorded so far, in issue order.
    pub async fn records(&self) -> Vec<ChannelOp> {
        self.state.lock().await.records.clone()
    }
}

#[async_trait]
impl ChannelSource for InMemoryBroker {
    async fn channel(&self) -> Result<Arc<dyn Channel>, tower::BoxError> {
        let mut state = self.state.lock().await;
        state.incarnations += 1;
        Ok(Arc::new(InMemoryChannel {
            incarnation: state.incarnations,
            state: Arc::clone(&self.state),
        }))
    }
}

/// One in-memory channel incarnation.
pub struct InMemoryChannel {
    incarnation: usize,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), tower::BoxError> {
        let mut state = self.state.lock().await;
        state.records.push(ChannelOp::Prefetch {
            channel: self.incarnation,
            count,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription, tower::BoxError> {
        let mut state = self.state.lock().await;
        state.consume_calls += 1;
        if state.fail_next_consume {
            state.fail_next_consume = false;
            return Err(format!("consume rejected for queue {queue}").into());
        }
        state.records.push(ChannelOp::Consume {
            channel: self.incarnation,
            queue: queue.to_owned(),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        state.active = Some(ActiveSubscription {
            incarnation: self.incarnation,
            sender,
        });
        Ok(Subscription {
            consumer_tag: format!("ctag-{}", self.incarnation),
            deliveries: Box::pin(UnboundedReceiverStream::new(receiver)),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), tower::BoxError> {
        let mut state = self.state.lock().await;
        // Stale cancels from an old incarnation must not tear down the
        // replacement subscription.
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.incarnation == self.incarnation)
        {
            state.active.take();
        }
        state.records.push(ChannelOp::Cancel {
            channel: self.incarnation,
            consumer_tag: consumer_tag.to_owned(),
        });
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), tower::BoxError> {
        let mut state = self.state.lock().await;
        state.records.push(ChannelOp::Ack {
            channel: self.incarnation,
            delivery_tag,
        });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), tower::BoxError> {
        let mut state = self.state.lock().await;
        state.records.push(ChannelOp::Nack {
            channel: self.incarnation,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), tower::BoxError> {
        let mut state = self.state.lock().await;
        state.records.push(ChannelOp::Reply {
            channel: self.incarnation,
            reply_to: reply_to.to_owned(),
            correlation_id: correlation_id.to_owned(),
            payload,
        });
        Ok(())
    }
}
