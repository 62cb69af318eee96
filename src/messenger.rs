// src/messenger.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnection, BrokerQueue, DeliveryStream, MessageProperties, QueueOptions};
use crate::connection::{Connection, ExchangeHandle};
use crate::errors::{MessengerError, Result};
use crate::exchange::Exchange;
use crate::lock;
use crate::message::{ErrorReply, Message};
use crate::registry::{MessageType, TypeRegistry};
use crate::subscription::{DisposePolicy, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerSettings {
    pub request_timeout: Duration,
    pub dispose: DisposePolicy,
}

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            dispose: DisposePolicy::default(),
        }
    }
}

/// Per-publish message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Options for a payload of a registered message type.
    pub fn typed<T: MessageType>() -> Self {
        Self::new().with_type(T::TYPE_NAME)
    }
}

impl From<PublishOptions> for MessageProperties {
    fn from(options: PublishOptions) -> Self {
        MessageProperties {
            correlation_id: options.correlation_id,
            message_type: options.message_type,
            headers: options.headers,
            reply_to: options.reply_to,
        }
    }
}

/// Publish, subscribe and request/reply over one [`Connection`].
pub struct MessengerService {
    connection: Arc<Connection>,
    registry: Arc<TypeRegistry>,
    settings: MessengerSettings,
    exchanges: HashMap<String, Exchange>,
}

impl MessengerService {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<TypeRegistry>,
        settings: MessengerSettings,
    ) -> Self {
        Self {
            connection,
            registry,
            settings,
            exchanges: HashMap::new(),
        }
    }

    /// Registers an exchange to declare on start with its own kind and options.
    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchanges.insert(exchange.name().to_owned(), exchange);
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn settings(&self) -> MessengerSettings {
        self.settings
    }

    pub async fn start(&self) -> Result<()> {
        self.connection.start().await?;
        for exchange in self.exchanges.values() {
            exchange.start(&self.connection).await?;
        }
        info!(
            label = self.connection.label(),
            exchanges = self.exchanges.len(),
            "Messenger started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for exchange in self.exchanges.values() {
            exchange.stop().await?;
        }
        self.connection.stop().await?;
        info!(label = self.connection.label(), "Messenger stopped");
        Ok(())
    }

    /// Serializes `data` as JSON and publishes it to `exchange`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let handle = self.exchange(exchange).await?;
        let content = serde_json::to_vec(data)?;
        debug!(
            exchange = handle.name(),
            routing_key,
            correlation_id = ?options.correlation_id,
            "Publishing message"
        );
        self.connection
            .native()?
            .publish(handle.name(), routing_key, content, options.into())
            .await?;
        Ok(())
    }

    /// Consumes messages routed to `exchange` with a key matching `routing_key`.
    ///
    /// Each subscription gets its own exclusive queue. Deliveries that fail
    /// validation are logged and dropped; `callback` only sees valid messages.
    pub async fn subscribe<F>(
        &self,
        exchange: &str,
        routing_key: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(exchange, routing_key, None, callback).await
    }

    /// Like [`subscribe`](Self::subscribe), but deliveries without a `type`
    /// property are decoded as `T`.
    pub async fn subscribe_typed<T, F>(
        &self,
        exchange: &str,
        routing_key: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        T: MessageType,
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(exchange, routing_key, Some(T::TYPE_NAME), callback)
            .await
    }

    async fn subscribe_with<F>(
        &self,
        exchange: &str,
        routing_key: &str,
        default_type: Option<&'static str>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let handle = self.exchange(exchange).await?;
        let queue = self.connection.queue("", QueueOptions::private()).await?;
        let subscription = match self
            .bind_and_consume(&queue, &handle, routing_key, default_type, callback)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                discard_queue(queue.as_ref()).await;
                return Err(err);
            }
        };
        debug!(
            exchange = handle.name(),
            routing_key,
            consumer_tag = subscription.consumer_tag(),
            "Subscribed"
        );
        Ok(subscription)
    }

    async fn bind_and_consume<F>(
        &self,
        queue: &Arc<dyn BrokerQueue>,
        handle: &ExchangeHandle,
        routing_key: &str,
        default_type: Option<&'static str>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if !handle.is_default() {
            queue.bind(handle.name(), routing_key).await?;
        }
        self.consume(queue.clone(), default_type, callback).await
    }

    /// Publishes `data` and waits for the correlated reply.
    ///
    /// The reply queue is private to this call and is disposed whatever the
    /// outcome. A reply typed [`ErrorReply`] becomes [`MessengerError::RemoteError`].
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &T,
        message_type: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let correlation_id = Uuid::new_v4().to_string();
        let queue = self.connection.queue("", QueueOptions::private()).await?;
        let reply_to = queue.name().to_owned();

        let (reply_tx, reply_rx) = oneshot::channel();
        let slot = Mutex::new(Some(reply_tx));
        let expected = correlation_id.clone();
        let consumed = self
            .consume(queue.clone(), None, move |message: Message| {
                if message.correlation_id() != Some(expected.as_str()) {
                    debug!(correlation_id = ?message.correlation_id(), "Ignoring unrelated reply");
                    return;
                }
                if let Some(reply_tx) = lock(&slot).take() {
                    let _ = reply_tx.send(message);
                }
            })
            .await;
        let subscription = match consumed {
            Ok(subscription) => subscription,
            Err(err) => {
                discard_queue(queue.as_ref()).await;
                return Err(err);
            }
        };

        let mut options = PublishOptions::new()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_to);
        options.message_type = message_type.map(str::to_owned);

        let outcome = match self.publish(exchange, routing_key, data, options).await {
            Ok(()) => tokio::time::timeout(timeout, reply_rx).await,
            Err(err) => {
                self.release_reply_queue(&subscription, &correlation_id).await;
                return Err(err);
            }
        };
        self.release_reply_queue(&subscription, &correlation_id).await;

        match outcome {
            Ok(Ok(reply)) if reply.message_type() == Some(ErrorReply::TYPE_NAME) => {
                let remote: ErrorReply = reply.deserialize()?;
                Err(MessengerError::RemoteError {
                    name: remote.name,
                    message: remote.message,
                })
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MessengerError::Transport(format!(
                "reply queue for request {correlation_id} closed without a reply"
            ))),
            Err(_) => {
                warn!(%correlation_id, exchange, routing_key, ?timeout, "Request timed out");
                Err(MessengerError::RequestTimedOut {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    async fn release_reply_queue(&self, subscription: &Subscription, correlation_id: &str) {
        if let Err(err) = subscription.dispose().await {
            warn!(correlation_id, error = %err, "Failed to dispose reply subscription");
        }
    }

    // Unregistered names are declared as durable topic exchanges.
    async fn exchange(&self, name: &str) -> Result<ExchangeHandle> {
        match self.exchanges.get(name) {
            Some(exchange) => exchange.start(&self.connection).await,
            None => Exchange::topic(name).start(&self.connection).await,
        }
    }

    async fn consume<F>(
        &self,
        queue: Arc<dyn BrokerQueue>,
        default_type: Option<&'static str>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let replier = self.connection.native()?;
        let (consumer_tag, deliveries) = queue.subscribe().await?;
        let task = tokio::spawn(deliver(
            deliveries,
            Decoding {
                registry: self.registry.clone(),
                default_type,
            },
            replier,
            consumer_tag.clone(),
            callback,
        ));
        Ok(Subscription::new(
            queue,
            consumer_tag,
            self.settings.dispose,
            Some(task),
        ))
    }
}

// Deletes a private queue that never got a live consumer.
async fn discard_queue(queue: &dyn BrokerQueue) {
    if let Err(err) = queue.destroy().await {
        warn!(queue = queue.name(), error = %err, "Failed to delete unused queue");
    }
    if let Err(err) = queue.close().await {
        warn!(queue = queue.name(), error = %err, "Failed to close unused queue");
    }
}

struct Decoding {
    registry: Arc<TypeRegistry>,
    // applied to deliveries that carry no `type` property
    default_type: Option<&'static str>,
}

async fn deliver<F>(
    mut deliveries: DeliveryStream,
    decoding: Decoding,
    replier: Arc<dyn BrokerConnection>,
    consumer_tag: String,
    callback: F,
) where
    F: Fn(Message) + Send + Sync + 'static,
{
    while let Some(mut delivery) = deliveries.next().await {
        if let (Some(default_type), Some(properties)) =
            (decoding.default_type, delivery.properties.as_mut())
        {
            properties
                .message_type
                .get_or_insert_with(|| default_type.to_owned());
        }
        match Message::new(delivery, &decoding.registry, Some(replier.clone())) {
            Ok(message) => callback(message),
            Err(err) => error!(%consumer_tag, error = %err, "Dropping malformed delivery"),
        }
    }
    debug!(%consumer_tag, "Delivery stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, MemoryBroker};

    async fn messenger(broker: &MemoryBroker) -> MessengerService {
        let connection = Arc::new(Connection::new(Arc::new(broker.clone()), "test"));
        let service = MessengerService::new(
            connection,
            Arc::new(TypeRegistry::new()),
            MessengerSettings::default(),
        )
        .with_exchange(Exchange::fanout("on.alert"));
        service.start().await.expect("start");
        service
    }

    #[test]
    fn publish_options_become_properties() {
        let properties: MessageProperties = PublishOptions::new()
            .with_type("Ping")
            .with_correlation_id("c")
            .with_reply_to("q")
            .with_header("trace", "t")
            .into();
        assert_eq!(properties.message_type.as_deref(), Some("Ping"));
        assert_eq!(properties.correlation_id.as_deref(), Some("c"));
        assert_eq!(properties.reply_to.as_deref(), Some("q"));
        assert_eq!(properties.headers["trace"], "t");
    }

    #[tokio::test]
    async fn start_declares_registered_exchanges() {
        let broker = MemoryBroker::new();
        let service = messenger(&broker).await;

        assert!(broker.has_exchange("on.alert"));
        let handle = service.exchange("on.alert").await.expect("exchange");
        assert_eq!(handle.kind(), ExchangeKind::Fanout);
        assert_eq!(broker.exchange_declarations("on.alert"), 1);
    }

    #[tokio::test]
    async fn unregistered_exchanges_default_to_topic() {
        let broker = MemoryBroker::new();
        let service = messenger(&broker).await;

        let handle = service.exchange("on.task").await.expect("exchange");
        assert_eq!(handle.kind(), ExchangeKind::Topic);
        assert!(handle.options().durable);
    }

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Alert {
        level: u8,
    }

    impl MessageType for Alert {
        const TYPE_NAME: &'static str = "Alert";
    }

    #[tokio::test]
    async fn typed_subscription_decodes_untyped_deliveries() {
        let broker = MemoryBroker::new();
        let connection = Arc::new(Connection::new(Arc::new(broker.clone()), "test"));
        let mut registry = TypeRegistry::new();
        registry.register::<Alert>();
        let service = MessengerService::new(connection, Arc::new(registry), MessengerSettings::default());
        service.start().await.expect("start");

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        service
            .subscribe_typed::<Alert, _>("on.alert", "#", move |message| {
                let _ = sender.send(message);
            })
            .await
            .expect("subscribe");
        service
            .publish("on.alert", "engine", &Alert { level: 2 }, PublishOptions::new())
            .await
            .expect("publish");

        let message = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("delivered")
            .expect("open");
        assert_eq!(message.message_type(), Some(Alert::TYPE_NAME));
        assert_eq!(message.data::<Alert>(), Some(&Alert { level: 2 }));
    }

    #[tokio::test]
    async fn failed_subscribe_deletes_its_private_queue() {
        let broker = MemoryBroker::new();
        let service = messenger(&broker).await;

        broker.fail_binds(1);
        let err = service
            .subscribe("on.task", "#", |_| {})
            .await
            .expect_err("bind fails");
        assert!(matches!(err, MessengerError::Transport(_)));
        assert_eq!(broker.queue_count(), 0);

        broker.fail_consumes(1);
        assert!(service.subscribe("on.task", "#", |_| {}).await.is_err());
        assert_eq!(broker.queue_count(), 0);

        let stats = broker.stats();
        assert_eq!((stats.destroys, stats.closes), (2, 2));
    }

    #[tokio::test]
    async fn failed_reply_consumer_deletes_the_reply_queue() {
        let broker = MemoryBroker::new();
        let service = messenger(&broker).await;
        broker.fail_consumes(1);

        let err = service
            .request("on.task", "task.run", &1, None, Some(Duration::from_millis(100)))
            .await
            .expect_err("request");
        assert!(matches!(err, MessengerError::Transport(_)));
        assert_eq!(broker.queue_count(), 0);
        assert_eq!(broker.stats().published, 0);
    }

    #[tokio::test]
    async fn publishing_requires_a_started_connection() {
        let broker = MemoryBroker::new();
        let connection = Arc::new(Connection::new(Arc::new(broker.clone()), "test"));
        let service = MessengerService::new(
            connection,
            Arc::new(TypeRegistry::new()),
            MessengerSettings::default(),
        );

        let err = service
            .publish("on.task", "task.started", &1, PublishOptions::new())
            .await
            .expect_err("publish");
        assert!(matches!(err, MessengerError::NotEstablished));
    }
}
