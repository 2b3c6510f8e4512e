//! Broker channel contracts and backends.
//!
//! This module defines the narrow surface `letterbox` consumes from a broker
//! connection: a [`ChannelSource`] that hands out channels, and a [`Channel`]
//! that can subscribe to a queue and settle deliveries.
//!
//! The contracts are deliberately small. Connection dialing, heartbeats and
//! topology declaration belong to the connection manager behind
//! [`ChannelSource`]; `letterbox` only ever asks it for a fresh channel and
//! observes the channel dying through the end of its delivery stream.
//!
//! ## Key components
//!
//! - [`ChannelSource`]: Connection-manager contract ("give me a channel")
//! - [`Channel`]: One channel incarnation (consume, cancel, prefetch, settle)
//! - [`ChannelSetup`]: Per-incarnation hook run before consuming
//! - [`RawDelivery`]: Structured decode of one raw delivered message
//! - [`Subscription`]: A consumer tag plus the stream of raw deliveries

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{collections::BTreeMap, sync::Arc};

use futures_core::stream::BoxStream;

pub use inmemory::InMemoryBroker;

/// Contract consumed from a connection manager.
///
/// Implementations are expected to serialize their own reconnection logic;
/// `letterbox` calls [`channel`](ChannelSource::channel) once per consumer
/// incarnation and never shares the returned channel between consumers.
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync + 'static {
    /// Acquire a fresh channel.
    async fn channel(&self) -> Result<Arc<dyn Channel>, tower::BoxError>;
}

/// One channel incarnation.
///
/// A channel is alive from acquisition until its delivery stream ends. All
/// acknowledgment calls are tied to the incarnation they were issued on;
/// settling a delivery against a dead incarnation is a best-effort operation
/// and implementations should fail softly rather than panic.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Cap the number of unacknowledged deliveries the broker keeps in
    /// flight on this channel. Zero means no limit.
    async fn prefetch(&self, count: u16) -> Result<(), tower::BoxError>;

    /// Start consuming from `queue`.
    ///
    /// Returns the broker-assigned consumer tag together with the stream of
    /// raw deliveries. The stream ending signals that the channel is gone.
    async fn consume(&self, queue: &str) -> Result<Subscription, tower::BoxError>;

    /// Cancel an active subscription by consumer tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), tower::BoxError>;

    /// Positively acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), tower::BoxError>;

    /// Negatively acknowledge one delivery, optionally requeueing it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), tower::BoxError>;

    /// Publish a reply to the address carried by an earlier delivery.
    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), tower::BoxError>;
}

/// Hook run once per channel incarnation, before consuming begins.
///
/// Typically used to declare queues or bindings. The hook is re-run on every
/// reestablishment, so it must be idempotent.
#[async_trait::async_trait]
pub trait ChannelSetup: Send + Sync + 'static {
    async fn setup(&self, channel: &dyn Channel) -> Result<(), tower::BoxError>;
}

/// An established subscription on one channel incarnation.
pub struct Subscription {
    /// Broker-assigned consumer tag, changes on every reestablishment.
    pub consumer_tag: String,
    /// Raw deliveries in arrival order. The stream ends when the channel
    /// dies or the subscription is cancelled.
    pub deliveries: BoxStream<'static, RawDelivery>,
}

/// One raw delivered message.
///
/// Mandatory fields (`delivery_tag`, `body`) are plain; everything the broker
/// may omit is an `Option` in [`DeliveryProperties`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDelivery {
    /// Transport-assigned identifier, unique within one channel incarnation.
    pub delivery_tag: u64,
    pub consumer_tag: String,
    /// May be empty when the default exchange was used.
    pub exchange: String,
    pub routing_key: String,
    /// True if the message has been sent to a consumer at least once.
    pub redelivered: bool,
    pub properties: DeliveryProperties,
    /// Message payload in binary form.
    pub body: Vec<u8>,
}

/// Optional metadata carried alongside a delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, serde_json::Value>,
    /// 1 for non-persistent, 2 for persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}
