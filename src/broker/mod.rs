// src/broker/mod.rs
// Transport seam between the messenger core and a concrete broker

pub mod amqp;
pub mod memory;
pub mod topic;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use amqp::AmqpBroker;
pub use memory::{BrokerStats, MemoryBroker};

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// Survives a broker restart.
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Exclusive, auto-deleted queue owned by a single consumer.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    Closing,
    Closed,
}

/// Routing metadata the broker attaches to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFields {
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
}

/// Message properties shared by outbound publishes and inbound deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub headers: HashMap<String, String>,
    pub reply_to: Option<String>,
}

/// A raw inbound delivery as handed over by a driver.
///
/// `fields` and `properties` are optional because drivers pass through whatever
/// the wire gave them; [`crate::Message::new`] decides whether that is acceptable.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub fields: Option<DeliveryFields>,
    pub properties: Option<MessageProperties>,
    pub content: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Transient resets are expected noise and never count against a retry budget.
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::ConnectionReset)
    }
}

/// Lifecycle signals a driver reports for one native connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Ready,
    Error(TransportError),
    Closed,
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Factory for native broker connections.
pub trait Broker: Send + Sync {
    /// Opens a native connection.
    ///
    /// The driver performs its own retry and backoff, reporting every failed
    /// attempt as [`TransportEvent::Error`] and success as [`TransportEvent::Ready`].
    fn connect(&self, label: &str) -> (Arc<dyn BrokerConnection>, TransportEvents);
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Declares a queue; an empty name asks the broker to generate one.
    async fn queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<dyn BrokerQueue>, TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    /// Requests disconnect. Completion is reported as [`TransportEvent::Closed`].
    async fn disconnect(&self);
}

#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> QueueState;

    async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), TransportError>;

    /// Registers a consumer, returning its tag and the delivery stream.
    async fn subscribe(&self) -> Result<(String, DeliveryStream), TransportError>;

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn destroy(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
