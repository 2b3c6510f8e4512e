//! Consumer lifecycle: subscribe, dispatch, reestablish, close.
//!
//! A [`Consumer`] owns one logical subscription. It acquires a channel from a
//! [`ChannelSource`], registers a delivery handler, and keeps the
//! subscription alive across channel loss by acquiring a replacement channel
//! and consuming again.
//!
//! The run loop is a single `select!` over the cancellation token and the
//! delivery stream, so there is exactly one place where channel loss, new
//! deliveries, and shutdown race. Each delivery is processed on its own task;
//! the broker's prefetch cap bounds how many overlap.
//!
//! ## Error propagation
//!
//! Per-message failures (decode, handler, reply) are reported on the error
//! stream and never stop the consumer. Lifecycle failures (channel lost with
//! reestablishment disabled, or a failed reestablishment attempt) are
//! terminal: they are reported exactly once and the run loop exits.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    channel::{Channel, ChannelSetup, ChannelSource, RawDelivery, Subscription},
    letter::{DecodeError, Letter, ReplyError},
    middleware::{Flow, Middleware},
};

/// Outcome of one handler invocation. A `Some` payload is forwarded to
/// [`Letter::reply`] when the consumer was configured with `auto_reply`.
pub type HandlerResult = Result<Option<Vec<u8>>, tower::BoxError>;

/// Boxed future returned by closure-based handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

/// Processes one delivered [`Letter`].
///
/// The handler may settle the letter itself or rely on the consumer's
/// `auto_ack`. Returning an `Err` nacks the letter with requeue (transient
/// failure assumed) and keeps the consumer running.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, letter: &mut Letter) -> HandlerResult;
}

/// Adapter turning a function into a [`Handler`].
///
/// ## Example
///
/// ```rust
/// use letterbox::consumer::{ClosureHandler, HandlerFuture};
/// use letterbox::Letter;
///
/// fn ack_everything(letter: &mut Letter) -> HandlerFuture<'_> {
///     Box::pin(async move {
///         letter.ack().await;
///         Ok(None)
///     })
/// }
///
/// let handler = ClosureHandler::new(ack_everything);
/// ```
pub struct ClosureHandler<F>(F);

impl<F> ClosureHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<F> Handler for ClosureHandler<F>
where
    F: for<'a> Fn(&'a mut Letter) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    async fn handle(&self, letter: &mut Letter) -> HandlerResult {
        (self.0)(letter).await
    }
}

/// Subscription configuration.
///
/// `middleware` runs in order ahead of the handler; `setup` runs once per
/// channel incarnation before consuming begins.
pub struct ConsumerConfig {
    /// Queue to consume from.
    pub queue: String,
    /// Unacknowledged-delivery cap applied per channel incarnation. Zero
    /// means no limit.
    pub prefetch: u16,
    /// Parse every payload as JSON; unparseable payloads become per-message
    /// decode errors instead of letters.
    pub json: bool,
    /// Ack a letter automatically when the handler returns `Ok` and the
    /// letter is still unsettled.
    pub auto_ack: bool,
    /// Forward a `Some` handler return value to [`Letter::reply`].
    pub auto_reply: bool,
    /// Reestablish the subscription when the channel dies. One attempt is
    /// made per loss; a failed attempt is terminal.
    pub reestablish: bool,
    /// Bound on how long [`Consumer::close`] waits for in-flight messages to
    /// settle before cancelling the subscription.
    pub grace: Duration,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub setup: Option<Arc<dyn ChannelSetup>>,
}

impl ConsumerConfig {
    /// Configuration with defaults: no prefetch limit, plain payloads,
    /// manual acknowledgment, reestablishment enabled, 30s close grace.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 0,
            json: false,
            auto_ack: false,
            auto_reply: false,
            reestablish: true,
            grace: Duration::from_secs(30),
            middleware: Vec::new(),
            setup: None,
        }
    }
}

/// A running subscription.
///
/// Constructed by [`Consumer::subscribe`], which performs the first
/// acquire-and-consume round trip before returning; the consumer is already
/// receiving deliveries when you hold one.
pub struct Consumer {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    errors: mpsc::UnboundedReceiver<ConsumerError>,
}

impl Consumer {
    /// Establish a subscription and start consuming.
    ///
    /// Acquires a channel from `source`, runs the configured setup hook,
    /// applies `prefetch`, and issues the consume call. Any failure along
    /// that path is returned as a [`SubscribeError`] and no consumer is
    /// created.
    pub async fn subscribe<S, H>(
        handler: H,
        source: S,
        config: ConsumerConfig,
    ) -> Result<Self, SubscribeError>
    where
        S: ChannelSource,
        H: Handler,
    {
        let channel = source.channel().await.map_err(SubscribeError::channel)?;
        if let Some(setup) = &config.setup {
            setup
                .setup(channel.as_ref())
                .await
                .map_err(SubscribeError::setup)?;
        }
        channel
            .prefetch(config.prefetch)
            .await
            .map_err(SubscribeError::channel)?;
        let subscription = channel
            .consume(&config.queue)
            .await
            .map_err(SubscribeError::consume)?;
        tracing::debug!(
            queue = %config.queue,
            consumer_tag = %subscription.consumer_tag,
            "subscription established",
        );

        let cancel = CancellationToken::new();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let worker = Worker {
            source,
            handler: Arc::new(handler),
            middleware: config.middleware.into(),
            setup: config.setup,
            queue: config.queue,
            prefetch: config.prefetch,
            json: config.json,
            auto_ack: config.auto_ack,
            auto_reply: config.auto_reply,
            reestablish: config.reestablish,
            grace: config.grace,
            errors: errors_tx,
            in_flight: InFlight::default(),
            cancel: cancel.clone(),
        };
        let worker = tokio::spawn(worker.run(channel, subscription));

        Ok(Self {
            cancel,
            worker,
            errors,
        })
    }

    /// The error/notification stream.
    ///
    /// Per-message errors may appear any number of times; a terminal error
    /// appears exactly once and is the last thing the stream carries.
    pub fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<ConsumerError> {
        &mut self.errors
    }

    /// True once the run loop has exited, either through
    /// [`close`](Consumer::close) or a terminal error.
    pub fn is_terminated(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cancel the subscription and disable reestablishment.
    ///
    /// Waits, bounded by the configured grace period, for in-flight messages
    /// to settle before cancelling the broker subscription. In-flight
    /// handlers are never aborted.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(error) = self.worker.await {
            tracing::warn!(%error, "consumer worker did not shut down cleanly");
        }
    }
}

struct Worker<S> {
    source: S,
    handler: Arc<dyn Handler>,
    middleware: Arc<[Arc<dyn Middleware>]>,
    setup: Option<Arc<dyn ChannelSetup>>,
    queue: String,
    prefetch: u16,
    json: bool,
    auto_ack: bool,
    auto_reply: bool,
    reestablish: bool,
    grace: Duration,
    errors: mpsc::UnboundedSender<ConsumerError>,
    in_flight: InFlight,
    cancel: CancellationToken,
}

impl<S: ChannelSource> Worker<S> {
    #[tracing::instrument(skip_all, fields(queue = %self.queue))]
    async fn run(mut self, mut channel: Arc<dyn Channel>, mut subscription: Subscription) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain(channel.as_ref(), &subscription.consumer_tag).await;
                    return;
                }
                delivery = subscription.deliveries.next() => match delivery {
                    Some(raw) => self.dispatch(raw, Arc::clone(&channel)),
                    None => {
                        if !self.reestablish {
                            tracing::error!("channel closed and reestablishment is disabled");
                            let _ = self.errors.send(ConsumerError::channel_lost());
                            return;
                        }
                        // One attempt per loss; a second failure here would
                        // mean the connection manager itself is broken, so
                        // bail instead of looping.
                        match self.resubscribe().await {
                            Ok((next_channel, next_subscription)) => {
                                tracing::info!(
                                    consumer_tag = %next_subscription.consumer_tag,
                                    "subscription reestablished",
                                );
                                channel = next_channel;
                                subscription = next_subscription;
                            }
                            Err(error) => {
                                tracing::error!(%error, "failed to reestablish subscription");
                                let _ = self.errors.send(ConsumerError::reestablish(error));
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn resubscribe(&self) -> Result<(Arc<dyn Channel>, Subscription), tower::BoxError> {
        let channel = self.source.channel().await?;
        if let Some(setup) = &self.setup {
            setup.setup(channel.as_ref()).await?;
        }
        channel.prefetch(self.prefetch).await?;
        let subscription = channel.consume(&self.queue).await?;
        Ok((channel, subscription))
    }

    /// Spawn the processing task for one raw delivery.
    ///
    /// The letter owns a completion guard tied to this worker's in-flight
    /// count; the guard fires on settlement or, at the latest, when the
    /// letter is dropped.
    fn dispatch(&self, raw: RawDelivery, channel: Arc<dyn Channel>) {
        let guard = self.in_flight.track();
        let handler = Arc::clone(&self.handler);
        let middleware = Arc::clone(&self.middleware);
        let errors = self.errors.clone();
        let json = self.json;
        let auto_ack = self.auto_ack;
        let auto_reply = self.auto_reply;

        tokio::spawn(async move {
            let mut letter = match Letter::new(raw, json, channel, guard) {
                Ok(letter) => letter,
                Err(error) => {
                    tracing::warn!(%error, "received undecodable delivery");
                    let _ = errors.send(ConsumerError::decode(error));
                    return;
                }
            };

            for stage in middleware.iter() {
                if let Flow::Halt = stage.handle(&mut letter).await {
                    return;
                }
            }

            match handler.handle(&mut letter).await {
                Ok(reply) => {
                    if auto_reply {
                        if let Some(payload) = reply {
                            if let Err(error) = letter.reply(payload).await {
                                tracing::warn!(%error, "automatic reply failed");
                                let _ = errors.send(ConsumerError::reply(error));
                            }
                        }
                    }
                    if auto_ack {
                        letter.ack().await;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        delivery_tag = letter.delivery_tag(),
                        %error,
                        "handler failed, requeueing",
                    );
                    let _ = errors.send(ConsumerError::handler(error));
                    letter.nack(true).await;
                }
            }
        });
    }

    async fn drain(&self, channel: &dyn Channel, consumer_tag: &str) {
        if tokio::time::timeout(self.grace, self.in_flight.idle())
            .await
            .is_err()
        {
            tracing::warn!(grace = ?self.grace, "closing with messages still in flight");
        }
        if let Err(error) = channel.cancel(consumer_tag).await {
            tracing::warn!(consumer_tag, %error, "failed to cancel subscription");
        }
    }
}

/// Count of received-but-not-yet-settled letters, shared between the worker
/// and every processing task it spawns.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    count: Arc<AtomicUsize>,
    settled: Arc<Notify>,
}

impl InFlight {
    pub(crate) fn track(&self) -> HandledGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        HandledGuard {
            count: Arc::clone(&self.count),
            settled: Arc::clone(&self.settled),
            fired: false,
        }
    }

    /// Resolves once the in-flight count reaches zero.
    ///
    /// The waiter must be registered before the count is checked:
    /// `notify_waiters` only reaches already-registered waiters, and a
    /// `Notified` future registers on poll, not on creation. `enable` closes
    /// the window in which the last guard could fire unobserved.
    pub(crate) async fn idle(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            settled.await;
        }
    }
}

/// One-shot completion signal for a single letter.
///
/// Fires on settlement; dropping an unfired guard fires it too, so a letter
/// that dies unhandled cannot leak an in-flight slot.
pub(crate) struct HandledGuard {
    count: Arc<AtomicUsize>,
    settled: Arc<Notify>,
    fired: bool,
}

impl HandledGuard {
    pub(crate) fn fire(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.count.fetch_sub(1, Ordering::AcqRel);
        self.settled.notify_waiters();
    }
}

impl Drop for HandledGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Error returned when establishing the first subscription fails.
#[derive(Debug)]
pub struct SubscribeError {
    context: SpanTrace,
    kind: SubscribeErrorKind,
}

/// Subscribe error kinds.
#[derive(Debug)]
pub enum SubscribeErrorKind {
    /// Channel acquisition or prefetch failed.
    Channel(tower::BoxError),
    /// The setup hook failed.
    Setup(tower::BoxError),
    /// The consume call was rejected.
    Consume(tower::BoxError),
}

impl SubscribeError {
    fn channel(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SubscribeErrorKind::Channel(err),
        }
    }

    fn setup(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SubscribeErrorKind::Setup(err),
        }
    }

    fn consume(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SubscribeErrorKind::Consume(err),
        }
    }

    pub fn kind(&self) -> &SubscribeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SubscribeErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
            SubscribeErrorKind::Setup(err) => writeln!(f, "Setup error: {err}"),
            SubscribeErrorKind::Consume(err) => writeln!(f, "Consume error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SubscribeErrorKind::Channel(err)
            | SubscribeErrorKind::Setup(err)
            | SubscribeErrorKind::Consume(err) => Some(err.as_ref()),
        }
    }
}

/// Error carried on the consumer's error/notification stream.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

/// Consumer error kinds.
#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// A payload could not be decoded as requested. Per-message.
    Decode(DecodeError),
    /// The handler returned an error; the message was nacked with requeue.
    /// Per-message.
    Handler(tower::BoxError),
    /// An automatic reply failed. Per-message.
    Reply(ReplyError),
    /// The channel closed and reestablishment is disabled. Terminal.
    ChannelLost,
    /// The reestablishment attempt after a channel loss failed. Terminal.
    Reestablish(tower::BoxError),
}

impl ConsumerError {
    fn decode(err: DecodeError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Decode(err),
        }
    }

    fn handler(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Handler(err),
        }
    }

    fn reply(err: ReplyError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Reply(err),
        }
    }

    fn channel_lost() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::ChannelLost,
        }
    }

    fn reestablish(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Reestablish(err),
        }
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }

    /// True for errors that stop the consumer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ConsumerErrorKind::ChannelLost | ConsumerErrorKind::Reestablish(_)
        )
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Decode(err) => writeln!(f, "Decode error: {err}"),
            ConsumerErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
            ConsumerErrorKind::Reply(err) => writeln!(f, "Reply error: {err}"),
            ConsumerErrorKind::ChannelLost => {
                writeln!(f, "Channel closed and reestablishment is disabled")
            }
            ConsumerErrorKind::Reestablish(err) => writeln!(f, "Reestablishment error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Decode(err) => Some(err),
            ConsumerErrorKind::Handler(err) => Some(err.as_ref()),
            ConsumerErrorKind::Reply(err) => Some(err),
            ConsumerErrorKind::ChannelLost => None,
            ConsumerErrorKind::Reestablish(err) => Some(err.as_ref()),
        }
    }
}
