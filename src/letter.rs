//! The message envelope.
//!
//! A [`Letter`] wraps one raw delivery with its immutable metadata, the
//! decoded payload views, and the one-shot handling state. It is the value
//! handed to middleware and the subscription handler.

use std::{collections::BTreeMap, sync::Arc};

use tracing_error::SpanTrace;

use crate::{
    channel::{Channel, RawDelivery},
    consumer::HandledGuard,
};

/// One delivered message, ready for processing.
///
/// ## Handling discipline
///
/// A letter is settled at most once: the first [`ack`](Letter::ack) or
/// [`nack`](Letter::nack) wins and every later call is a silent no-op. The
/// settle calls never fail; if the broker cannot be reached the failure is
/// logged and the message is left to the broker's redelivery machinery.
///
/// [`reply`](Letter::reply) is independent of settlement: it neither requires
/// nor implies that the letter has been acked or nacked.
///
/// ## Ownership
///
/// Each letter is exclusively owned by the task processing its delivery. It
/// remembers the channel incarnation it arrived on and routes every broker
/// call there, so a letter that outlives a reestablishment never settles
/// against the wrong channel.
pub struct Letter {
    raw: RawDelivery,
    text: String,
    json: Option<serde_json::Value>,
    state: HandlingState,
    channel: Arc<dyn Channel>,
    guard: HandledGuard,
}

#[derive(Debug, Default, Clone, Copy)]
struct HandlingState {
    acked: bool,
    nacked: bool,
    replied: bool,
}

impl HandlingState {
    fn handled(&self) -> bool {
        self.acked || self.nacked
    }
}

impl Letter {
    /// Build a letter from a raw delivery.
    ///
    /// When `parse_json` is set and the body is not valid JSON the letter is
    /// never constructed; the delivery stays unacknowledged.
    pub(crate) fn new(
        raw: RawDelivery,
        parse_json: bool,
        channel: Arc<dyn Channel>,
        guard: HandledGuard,
    ) -> Result<Self, DecodeError> {
        let text = String::from_utf8_lossy(&raw.body).into_owned();
        let json = if parse_json {
            Some(serde_json::from_slice(&raw.body).map_err(DecodeError::json)?)
        } else {
            None
        };
        Ok(Self {
            raw,
            text,
            json,
            state: HandlingState::default(),
            channel,
            guard,
        })
    }

    /// Mark the message as done, removing it from the queue.
    ///
    /// No-op if the letter has already been settled.
    pub async fn ack(&mut self) {
        if self.state.handled() {
            return;
        }
        self.state.acked = true;
        if let Err(error) = self.channel.ack(self.raw.delivery_tag).await {
            tracing::warn!(
                delivery_tag = self.raw.delivery_tag,
                %error,
                "acknowledgment did not reach the broker",
            );
        }
        self.guard.fire();
    }

    /// Negatively acknowledge the message.
    ///
    /// With `requeue` set the message is returned to the front of the queue,
    /// otherwise it is discarded or dead-lettered. No-op if the letter has
    /// already been settled.
    pub async fn nack(&mut self, requeue: bool) {
        if self.state.handled() {
            return;
        }
        self.state.nacked = true;
        if let Err(error) = self.channel.nack(self.raw.delivery_tag, requeue).await {
            tracing::warn!(
                delivery_tag = self.raw.delivery_tag,
                requeue,
                %error,
                "negative acknowledgment did not reach the broker",
            );
        }
        self.guard.fire();
    }

    /// Reply to the message.
    ///
    /// Only valid when the delivery carried both a `reply_to` address and a
    /// `correlation_id`; calling it on anything else is a usage error and
    /// returns [`ReplyErrorKind::NotReplyable`]. Replying does not settle the
    /// letter.
    pub async fn reply(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), ReplyError> {
        let (Some(reply_to), Some(correlation_id)) = (
            self.raw.properties.reply_to.clone(),
            self.raw.properties.correlation_id.clone(),
        ) else {
            return Err(ReplyError::not_replyable());
        };
        self.state.replied = true;
        self.channel
            .reply(&reply_to, &correlation_id, payload.into())
            .await
            .map_err(ReplyError::publish)
    }

    /// True once the letter has been acked or nacked.
    pub fn is_handled(&self) -> bool {
        self.state.handled()
    }

    pub fn is_acked(&self) -> bool {
        self.state.acked
    }

    pub fn is_nacked(&self) -> bool {
        self.state.nacked
    }

    pub fn is_replied(&self) -> bool {
        self.state.replied
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.raw.body
    }

    /// Payload decoded as UTF-8, lossily.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Payload parsed as JSON. Present only when the consumer was configured
    /// with `json: true`.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json.as_ref()
    }

    /// Deserialize the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_slice(&self.raw.body).map_err(DecodeError::json)
    }

    /// Look up a single header. Absent names yield `None`.
    pub fn header(&self, name: &str) -> Option<&serde_json::Value> {
        self.raw.properties.headers.get(name)
    }

    pub fn headers(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.raw.properties.headers
    }

    /// The raw delivery this letter was built from.
    pub fn raw(&self) -> &RawDelivery {
        &self.raw
    }

    pub fn delivery_tag(&self) -> u64 {
        self.raw.delivery_tag
    }

    pub fn consumer_tag(&self) -> &str {
        &self.raw.consumer_tag
    }

    pub fn exchange(&self) -> &str {
        &self.raw.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.raw.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.raw.redelivered
    }

    pub fn content_type(&self) -> Option<&str> {
        self.raw.properties.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.raw.properties.content_encoding.as_deref()
    }

    /// 1 for non-persistent, 2 for persistent.
    pub fn delivery_mode(&self) -> Option<u8> {
        self.raw.properties.delivery_mode
    }

    pub fn priority(&self) -> Option<u8> {
        self.raw.properties.priority
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.raw.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.raw.properties.reply_to.as_deref()
    }

    pub fn expiration(&self) -> Option<&str> {
        self.raw.properties.expiration.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.raw.properties.message_id.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.raw.properties.timestamp
    }

    /// The AMQP `type` property.
    pub fn kind(&self) -> Option<&str> {
        self.raw.properties.kind.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.raw.properties.user_id.as_deref()
    }

    pub fn app_id(&self) -> Option<&str> {
        self.raw.properties.app_id.as_deref()
    }
}

impl std::fmt::Debug for Letter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Letter")
            .field("delivery_tag", &self.raw.delivery_tag)
            .field("consumer_tag", &self.raw.consumer_tag)
            .field("exchange", &self.raw.exchange)
            .field("routing_key", &self.raw.routing_key)
            .field("redelivered", &self.raw.redelivered)
            .field("acked", &self.state.acked)
            .field("nacked", &self.state.nacked)
            .field("replied", &self.state.replied)
            .finish_non_exhaustive()
    }
}

/// Error returned when a payload cannot be decoded as requested.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    source: serde_json::Error,
}

impl DecodeError {
    fn json(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err,
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Invalid JSON payload: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Error returned by [`Letter::reply`].
#[derive(Debug)]
pub struct ReplyError {
    context: SpanTrace,
    kind: ReplyErrorKind,
}

/// Reply error kinds.
#[derive(Debug)]
pub enum ReplyErrorKind {
    /// The delivery carried no `reply_to` address or no `correlation_id`.
    NotReplyable,
    /// Publishing the reply failed.
    Publish(tower::BoxError),
}

impl ReplyError {
    fn not_replyable() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ReplyErrorKind::NotReplyable,
        }
    }

    fn publish(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ReplyErrorKind::Publish(err),
        }
    }

    pub fn kind(&self) -> &ReplyErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ReplyErrorKind::NotReplyable => {
                writeln!(f, "Message has no reply_to address or correlation_id")
            }
            ReplyErrorKind::Publish(err) => writeln!(f, "Reply publish error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ReplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ReplyErrorKind::NotReplyable => None,
            ReplyErrorKind::Publish(err) => Some(err.as_ref()),
        }
    }
}
