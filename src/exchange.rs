// src/exchange.rs

use crate::broker::{ExchangeKind, ExchangeOptions};
use crate::config::ExchangeConfig;
use crate::connection::{Connection, ExchangeHandle};
use crate::errors::Result;

/// A named exchange the messenger declares when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            options: ExchangeOptions::default(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.options.durable = durable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn options(&self) -> ExchangeOptions {
        self.options
    }

    /// Declares the exchange through the connection's single-flight cache.
    pub async fn start(&self, connection: &Connection) -> Result<ExchangeHandle> {
        connection
            .exchange(&self.name, self.kind, self.options)
            .await
    }

    /// Exchanges outlive their users on the broker; nothing to tear down.
    pub async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

impl From<&ExchangeConfig> for Exchange {
    fn from(config: &ExchangeConfig) -> Self {
        Exchange::new(config.name.clone(), config.kind).with_durable(config.durable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn builders_set_kind_and_durability() {
        let exchange = Exchange::fanout("on.alert").with_durable(false);
        assert_eq!(exchange.kind(), ExchangeKind::Fanout);
        assert!(!exchange.options().durable);
        assert!(Exchange::topic("t").options().durable);
    }

    #[test]
    fn converts_from_config() {
        let config = ExchangeConfig {
            name: "on.task".to_string(),
            kind: ExchangeKind::Direct,
            durable: false,
        };
        let exchange = Exchange::from(&config);
        assert_eq!(exchange, Exchange::direct("on.task").with_durable(false));
    }

    #[tokio::test]
    async fn start_declares_once_per_connection() {
        let broker = MemoryBroker::new();
        let connection = Connection::new(Arc::new(broker.clone()), "test");
        connection.start().await.expect("start");

        let exchange = Exchange::topic("on.task");
        let handle = exchange.start(&connection).await.expect("first");
        exchange.start(&connection).await.expect("second");
        exchange.stop().await.expect("stop");

        assert_eq!(handle.name(), "on.task");
        assert_eq!(broker.exchange_declarations("on.task"), 1);
        assert!(broker.has_exchange("on.task"));
    }
}
