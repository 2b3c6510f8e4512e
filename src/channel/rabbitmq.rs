//! RabbitMQ channel backend built on `lapin`.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt as _};

use crate::channel::{Channel, ChannelSource, DeliveryProperties, RawDelivery, Subscription};

/// Channel source backed by a `lapin::Connection`.
///
/// Dialing, heartbeats, and connection-level recovery stay with whoever owns
/// the connection; this source only creates channels on it.
pub struct RabbitMqSource {
    connection: Arc<lapin::Connection>,
}

impl RabbitMqSource {
    pub fn new(connection: Arc<lapin::Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ChannelSource for RabbitMqSource {
    async fn channel(&self) -> Result<Arc<dyn Channel>, tower::BoxError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(RabbitMqChannel {
            channel: Arc::new(Mutex::new(channel)),
        }))
    }
}

/// One AMQP channel incarnation.
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `lapin::Channel` is not
/// `Sync` and settle calls arrive from concurrent processing tasks.
pub struct RabbitMqChannel {
    channel: Arc<Mutex<lapin::Channel>>,
}

#[async_trait]
impl Channel for RabbitMqChannel {
    async fn prefetch(&self, count: u16) -> Result<(), tower::BoxError> {
        let channel = self.channel.lock().await;
        channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    /// Start consuming with a broker-assigned consumer tag.
    ///
    /// A forwarder task pumps the lapin consumer into the subscription
    /// stream. The stream ends when the lapin consumer ends or errors, which
    /// is how channel loss reaches the `Consumer`.
    async fn consume(&self, queue: &str) -> Result<Subscription, tower::BoxError> {
        let channel = self.channel.lock().await;
        let mut consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag().as_str().to_owned();

        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = consumer_tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if sender.send(raw_delivery(delivery, &tag)).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            consumer_tag = %tag,
                            %error,
                            "consumer stream failed, treating channel as closed",
                        );
                        return;
                    }
                }
            }
        });

        Ok(Subscription {
            consumer_tag,
            deliveries: Box::pin(UnboundedReceiverStream::new(receiver)),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), tower::BoxError> {
        let channel = self.channel.lock().await;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), tower::BoxError> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), tower::BoxError> {
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Publish a reply on the default exchange, addressed by queue name,
    /// carrying the original correlation id. Waits for broker confirmation.
    async fn reply(
        &self,
        reply_to: &str,
        correlation_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), tower::BoxError> {
        let properties = BasicProperties::default().with_correlation_id(correlation_id.into());
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

fn raw_delivery(delivery: lapin::message::Delivery, consumer_tag: &str) -> RawDelivery {
    let properties = &delivery.properties;
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_owned(),
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: DeliveryProperties {
            content_type: properties.content_type().as_ref().map(|v| v.as_str().to_owned()),
            content_encoding: properties
                .content_encoding()
                .as_ref()
                .map(|v| v.as_str().to_owned()),
            headers: properties
                .headers()
                .as_ref()
                .map(field_table_to_map)
                .unwrap_or_default(),
            delivery_mode: *properties.delivery_mode(),
            priority: *properties.priority(),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|v| v.as_str().to_owned()),
            reply_to: properties.reply_to().as_ref().map(|v| v.as_str().to_owned()),
            expiration: properties.expiration().as_ref().map(|v| v.as_str().to_owned()),
            message_id: properties.message_id().as_ref().map(|v| v.as_str().to_owned()),
            timestamp: *properties.timestamp(),
            kind: properties.kind().as_ref().map(|v| v.as_str().to_owned()),
            user_id: properties.user_id().as_ref().map(|v| v.as_str().to_owned()),
            app_id: properties.app_id().as_ref().map(|v| v.as_str().to_owned()),
        },
        body: delivery.data,
    }
}

fn field_table_to_map(table: &FieldTable) -> BTreeMap<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), amqp_value_to_json(value)))
        .collect()
}

/// Best-effort mapping of AMQP header values onto JSON. Types with no JSON
/// counterpart (decimals, byte arrays) become `Null`.
fn amqp_value_to_json(value: &AMQPValue) -> serde_json::Value {
    match value {
        AMQPValue::Boolean(v) => (*v).into(),
        AMQPValue::ShortShortInt(v) => (*v).into(),
        AMQPValue::ShortShortUInt(v) => (*v).into(),
        AMQPValue::ShortInt(v) => (*v).into(),
        AMQPValue::ShortUInt(v) => (*v).into(),
        AMQPValue::LongInt(v) => (*v).into(),
        AMQPValue::LongUInt(v) => (*v).into(),
        AMQPValue::LongLongInt(v) => (*v).into(),
        AMQPValue::Float(v) => (*v).into(),
        AMQPValue::Double(v) => (*v).into(),
        AMQPValue::ShortString(v) => v.as_str().into(),
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned().into(),
        AMQPValue::Timestamp(v) => (*v).into(),
        AMQPValue::FieldArray(values) => serde_json::Value::Array(
            values.as_slice().iter().map(amqp_value_to_json).collect(),
        ),
        AMQPValue::FieldTable(table) => serde_json::Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), amqp_value_to_json(value)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}
