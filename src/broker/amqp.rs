// src/broker/amqp.rs
// AMQP 0-9-1 driver backed by lapin

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
    ExchangeKind as LapinExchangeKind,
};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Broker, BrokerConnection, BrokerQueue, Delivery, DeliveryFields, DeliveryStream,
    ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions, QueueState, TransportError,
    TransportEvent, TransportEvents,
};
use crate::lock;

pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

impl From<LapinError> for TransportError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::IOError(io) if io.kind() == ErrorKind::ConnectionReset => {
                TransportError::ConnectionReset
            }
            LapinError::IOError(io) if io.kind() == ErrorKind::ConnectionRefused => {
                TransportError::Refused(error.to_string())
            }
            LapinError::InvalidConnectionState(_) => TransportError::Closed,
            _ => TransportError::Other(error.to_string()),
        }
    }
}

impl From<ExchangeKind> for LapinExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => LapinExchangeKind::Topic,
            ExchangeKind::Direct => LapinExchangeKind::Direct,
            ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        }
    }
}

/// Connects to a RabbitMQ-compatible broker at `uri`.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
    reconnect_delay_ms: u64,
    max_reconnect_delay_ms: u64,
}

impl AmqpBroker {
    pub fn new(uri: &str) -> Self {
        AmqpBroker {
            uri: uri.to_string(),
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: MAX_RECONNECT_DELAY_MS,
        }
    }

    pub fn with_reconnect_policy(mut self, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.reconnect_delay_ms = initial_delay_ms.max(1);
        self.max_reconnect_delay_ms = max_delay_ms.max(self.reconnect_delay_ms);
        self
    }
}

fn connection_properties(label: &str) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(label.into())
}

impl Broker for AmqpBroker {
    fn connect(&self, label: &str) -> (Arc<dyn BrokerConnection>, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let link = Arc::new(AmqpConnection {
            label: label.to_string(),
            live: Mutex::new(None),
            events,
            shutdown,
        });
        tokio::spawn(establish(link.clone(), self.clone()));
        (link, receiver)
    }
}

struct Live {
    connection: Arc<Connection>,
    channel: Channel,
}

struct AmqpConnection {
    label: String,
    live: Mutex<Option<Live>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
}

impl AmqpConnection {
    fn report(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn channel(&self) -> Result<Channel, TransportError> {
        lock(&self.live)
            .as_ref()
            .map(|live| live.channel.clone())
            .ok_or(TransportError::Closed)
    }

    fn connection(&self) -> Result<Arc<Connection>, TransportError> {
        lock(&self.live)
            .as_ref()
            .map(|live| live.connection.clone())
            .ok_or(TransportError::Closed)
    }
}

// Retries the initial connect with exponential backoff until it succeeds or
// disconnect is requested. Every failed attempt is reported as an event.
async fn establish(link: Arc<AmqpConnection>, broker: AmqpBroker) {
    let mut shutdown = link.shutdown.subscribe();
    let mut delay = broker.reconnect_delay_ms;
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            return;
        }
        attempt += 1;
        info!(label = %link.label, attempt, "Attempting to connect to broker");

        match open(&broker.uri, &link).await {
            Ok(live) => {
                if *shutdown.borrow() {
                    let _ = live.connection.close(200, "Disconnect requested").await;
                    return;
                }
                *lock(&link.live) = Some(live);
                link.report(TransportEvent::Ready);
                return;
            }
            Err(err) => {
                debug!(label = %link.label, attempt, error = %err, "Broker connect attempt failed");
                link.report(TransportEvent::Error(err));
            }
        }

        // Exponential backoff with jitter
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
        let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
        debug!(label = %link.label, "Waiting {}ms before next connect attempt", sleep_time);
        tokio::select! {
            _ = sleep(Duration::from_millis(sleep_time)) => {}
            _ = shutdown.changed() => {}
        }
        delay = std::cmp::min(delay * 2, broker.max_reconnect_delay_ms);
    }
}

async fn open(uri: &str, link: &Arc<AmqpConnection>) -> Result<Live, TransportError> {
    let connection = Connection::connect(uri, connection_properties(&link.label)).await?;

    let events = link.events.clone();
    connection.on_error(move |err| {
        let _ = events.send(TransportEvent::Error(err.into()));
    });

    match connection.create_channel().await {
        Ok(channel) => Ok(Live {
            connection: Arc::new(connection),
            channel,
        }),
        Err(err) => {
            let _ = connection.close(0, "Channel setup failed").await;
            Err(err.into())
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.channel()?
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<dyn BrokerQueue>, TransportError> {
        // one channel per queue so closing a subscription never affects others
        let channel = self.connection()?.create_channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Arc::new(AmqpQueue {
            name: queue.name().as_str().to_owned(),
            channel,
            closing: AtomicBool::new(false),
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.channel()?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &content,
                basic_properties(properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        let live = lock(&self.live).take();
        if let Some(live) = live {
            info!(label = %self.label, "Closing broker connection gracefully");
            if let Err(err) = live.connection.close(200, "Closing connection").await {
                warn!(label = %self.label, error = %err, "Broker connection did not close cleanly");
            }
        }
        self.report(TransportEvent::Closed);
    }
}

fn basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_timestamp(chrono::Utc::now().timestamp() as u64);
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(message_type) = properties.message_type {
        basic = basic.with_type(message_type.into());
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in properties.headers {
            headers.insert(key.into(), AMQPValue::LongString(value.into()));
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(text) => String::from_utf8_lossy(text.as_bytes()).into_owned(),
        AMQPValue::ShortString(text) => text.as_str().to_owned(),
        other => format!("{:?}", other),
    }
}

fn delivery_from(delivery: lapin::message::Delivery, consumer_tag: &str) -> Delivery {
    let basic = &delivery.properties;
    let headers: HashMap<String, String> = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), header_value(value)))
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        correlation_id: basic.correlation_id().as_ref().map(|id| id.as_str().to_owned()),
        message_type: basic.kind().as_ref().map(|kind| kind.as_str().to_owned()),
        headers,
        reply_to: basic.reply_to().as_ref().map(|to| to.as_str().to_owned()),
    };

    Delivery {
        fields: Some(DeliveryFields {
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        }),
        properties: Some(properties),
        content: delivery.data,
    }
}

struct AmqpQueue {
    name: String,
    channel: Channel,
    closing: AtomicBool,
}

#[async_trait]
impl BrokerQueue for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> QueueState {
        if !self.channel.status().connected() {
            QueueState::Closed
        } else if self.closing.load(Ordering::SeqCst) {
            QueueState::Closing
        } else {
            QueueState::Open
        }
    }

    async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &self.name,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<(String, DeliveryStream), TransportError> {
        let tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                &self.name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream_tag = tag.clone();
        let deliveries = consumer
            .filter_map(move |result| {
                let tag = stream_tag.clone();
                async move {
                    match result {
                        Ok(delivery) => Some(delivery_from(delivery, &tag)),
                        Err(err) => {
                            error!(consumer_tag = %tag, error = %err, "Error receiving delivery");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok((tag, deliveries))
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        self.channel
            .queue_delete(&self.name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        self.channel.close(200, "Subscription disposed").await?;
        Ok(())
    }
}
