//! AMQP (RabbitMQ) broker binding.
//!
//! One `lapin::Connection` per `Link`; each logical `BrokerChannel` wraps a
//! `lapin::Channel`. Connection errors flip the link's `closed` watch so the
//! transport can reconnect and replay topology.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{
    Acker, Binding, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, Link, MessageProperties, OutboundMessage, QueueSpec, Result,
};

/// Header carrying the delivery delay for `x-delayed-message` exchanges.
const DELAY_HEADER: &str = "x-delay";

/// Connector for a RabbitMQ endpoint.
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Link>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_error = Arc::clone(&closed_tx);
        let endpoint = self.endpoint();
        connection.on_error(move |e| {
            error!(endpoint = %endpoint, error = %e, "AMQP connection error");
            on_error.send_replace(true);
        });

        info!(endpoint = %self.endpoint(), "AMQP connection established");
        Ok(Arc::new(AmqpLink {
            connection,
            closed: closed_tx,
        }))
    }

    fn endpoint(&self) -> String {
        redact_credentials(&self.url)
    }
}

/// Strip `user:password@` from an AMQP URL.
fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

struct AmqpLink {
    connection: Connection,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Link for AmqpLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Delayed => lapin::ExchangeKind::Custom(kind.as_str().to_string()),
    }
}

fn to_basic_properties(message: &OutboundMessage) -> BasicProperties {
    let props = &message.properties;
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(correlation_id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    let mut headers = FieldTable::default();
    for (key, value) in &props.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    if let Some(delay) = message.delay {
        let millis = i32::try_from(delay.as_millis()).unwrap_or(i32::MAX);
        headers.insert(ShortString::from(DELAY_HEADER), AMQPValue::LongInt(millis));
    }
    if !headers.inner().is_empty() {
        properties = properties.with_headers(headers);
    }
    properties
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                );
            }
        }
    }
    MessageProperties {
        content_type: properties.content_type().as_ref().map(|s| s.to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.to_string()),
        headers,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.no_wait,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare queue: {}", e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut arguments = FieldTable::default();
        if spec.kind == ExchangeKind::Delayed {
            arguments.insert(
                ShortString::from("x-delayed-type"),
                AMQPValue::LongString("direct".into()),
            );
        }
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(&spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to declare exchange: {}", e)))
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("Failed to bind queue: {}", e)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let properties = to_basic_properties(&message);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(exchange, routing_key, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(move |delivery| {
            delivery
                .map(|d| into_delivery(d, auto_ack))
                .map_err(|e| BusError::Consume(format!("Consumer error: {}", e)))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
    }
}

fn into_delivery(delivery: LapinDelivery, auto_ack: bool) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        delivery.data,
        properties,
        Box::new(AmqpAcker {
            acker: delivery.acker,
            auto_ack,
        }),
    )
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    auto_ack: bool,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to reject: {}", e)))
    }
}
