// src/connection.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch, OnceCell};
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, BrokerConnection, BrokerQueue, ExchangeKind, ExchangeOptions, QueueOptions,
    TransportEvent, TransportEvents,
};
use crate::errors::{MessengerError, Result};
use crate::lock;

pub const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 60;

/// A declared exchange as seen by one [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
}

impl ExchangeHandle {
    /// The broker's nameless default exchange; routes by queue name.
    pub fn default_exchange() -> Self {
        Self {
            name: String::new(),
            kind: ExchangeKind::Direct,
            options: ExchangeOptions::default(),
        }
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

    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Clone)]
struct Link {
    native: Arc<dyn BrokerConnection>,
    // set by this link's first ready signal, never by an earlier start
    ready: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

#[derive(Default)]
struct Shared {
    link: Mutex<Option<Link>>,
    established: AtomicBool,
    retries: AtomicU32,
    exchanges: Mutex<HashMap<String, Arc<OnceCell<ExchangeHandle>>>>,
}

impl Shared {
    // Clears the handle only if it still belongs to `native`.
    fn release(&self, native: &Arc<dyn BrokerConnection>) {
        let mut link = lock(&self.link);
        if link
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.native, native))
        {
            *link = None;
        }
    }
}

/// One logical broker link.
///
/// The driver retries the connect on its own; every `start()` counts those
/// failures against `max_connection_retries` until its link is ready.
/// `initial_connection_retries` only counts failures before the very first
/// ready signal and is frozen after it.
pub struct Connection {
    broker: Arc<dyn Broker>,
    label: String,
    max_connection_retries: u32,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(broker: Arc<dyn Broker>, label: impl Into<String>) -> Self {
        Self {
            broker,
            label: label.into(),
            max_connection_retries: DEFAULT_MAX_CONNECTION_RETRIES,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn with_max_connection_retries(mut self, max_connection_retries: u32) -> Self {
        self.max_connection_retries = max_connection_retries;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.link)
            .as_ref()
            .is_some_and(|link| link.ready.load(Ordering::SeqCst))
    }

    pub fn initial_connection_established(&self) -> bool {
        self.shared.established.load(Ordering::SeqCst)
    }

    pub fn initial_connection_retries(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut link = lock(&self.shared.link);
            if link.is_some() {
                return Err(MessengerError::AlreadyStarted);
            }
            let (native, events) = self.broker.connect(&self.label);
            let (closed_tx, closed_rx) = watch::channel(false);
            let ready = Arc::new(AtomicBool::new(false));
            *link = Some(Link {
                native: native.clone(),
                ready: ready.clone(),
                closed: closed_rx,
            });

            let pump = EventPump {
                shared: self.shared.clone(),
                native,
                ready,
                label: self.label.clone(),
                max_retries: self.max_connection_retries,
                attempts: 0,
                outcome: Some(outcome_tx),
                closed: closed_tx,
            };
            tokio::spawn(pump.run(events));
        }

        info!(label = %self.label, "Connecting to broker");
        outcome_rx.await.unwrap_or_else(|_| {
            Err(MessengerError::Transport(
                "connection event loop ended before start completed".to_string(),
            ))
        })
    }

    pub async fn stop(&self) -> Result<()> {
        let link = lock(&self.shared.link)
            .take()
            .ok_or(MessengerError::NotStarted)?;
        link.ready.store(false, Ordering::SeqCst);
        lock(&self.shared.exchanges).clear();

        info!(label = %self.label, "Disconnecting from broker");
        link.native.disconnect().await;

        let mut closed = link.closed;
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        debug!(label = %self.label, "Broker connection closed");
        Ok(())
    }

    /// Resolves a declared exchange, declaring it at most once per connection.
    ///
    /// An empty name is the broker's default exchange and is never declared.
    /// Concurrent first requests for the same name share one declaration.
    pub async fn exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<ExchangeHandle> {
        let native = self.native()?;
        if name.is_empty() {
            return Ok(ExchangeHandle::default_exchange());
        }

        let cell = lock(&self.shared.exchanges)
            .entry(name.to_owned())
            .or_default()
            .clone();
        let handle = cell
            .get_or_try_init(|| async {
                debug!(label = %self.label, exchange = name, ?kind, "Declaring exchange");
                native.declare_exchange(name, kind, options).await?;
                Ok::<_, MessengerError>(ExchangeHandle {
                    name: name.to_owned(),
                    kind,
                    options,
                })
            })
            .await?;

        if handle.kind != kind || handle.options != options {
            debug!(
                exchange = name,
                cached = ?handle.kind,
                requested = ?kind,
                "Returning cached exchange declared with other options"
            );
        }
        Ok(handle.clone())
    }

    pub async fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>> {
        Ok(self.native()?.queue(name, options).await?)
    }

    pub(crate) fn native(&self) -> Result<Arc<dyn BrokerConnection>> {
        let link = lock(&self.shared.link);
        match link.as_ref() {
            Some(link) if link.ready.load(Ordering::SeqCst) => Ok(link.native.clone()),
            _ => Err(MessengerError::NotEstablished),
        }
    }
}

struct EventPump {
    shared: Arc<Shared>,
    native: Arc<dyn BrokerConnection>,
    ready: Arc<AtomicBool>,
    label: String,
    max_retries: u32,
    // failures seen by this start, whether or not it is the first one
    attempts: u32,
    outcome: Option<oneshot::Sender<Result<()>>>,
    closed: watch::Sender<bool>,
}

impl EventPump {
    async fn run(mut self, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Ready => {
                    self.ready.store(true, Ordering::SeqCst);
                    if self.shared.established.swap(true, Ordering::SeqCst) {
                        info!(label = %self.label, attempts = self.attempts, "Broker connection re-established");
                    } else {
                        info!(
                            label = %self.label,
                            retries = self.shared.retries.load(Ordering::SeqCst),
                            "Broker connection established"
                        );
                    }
                    self.resolve(Ok(()));
                }
                TransportEvent::Error(err) if err.is_benign() => {
                    debug!(label = %self.label, error = %err, "Ignoring transient broker reset");
                }
                TransportEvent::Error(err) if self.ready.load(Ordering::SeqCst) => {
                    warn!(label = %self.label, error = %err, "Broker connection error");
                }
                TransportEvent::Error(err) => {
                    self.attempts += 1;
                    if !self.shared.established.load(Ordering::SeqCst) {
                        self.shared.retries.fetch_add(1, Ordering::SeqCst);
                    }
                    let retries = self.attempts;
                    if retries > self.max_retries {
                        error!(
                            label = %self.label,
                            retries,
                            error = %err,
                            "Max connection retries exceeded, giving up"
                        );
                        self.shared.release(&self.native);
                        self.resolve(Err(MessengerError::MaxRetriesExceeded { retries }));
                        self.native.disconnect().await;
                        break;
                    }
                    warn!(
                        label = %self.label,
                        attempt = retries,
                        max = self.max_retries,
                        error = %err,
                        "Broker connection attempt failed"
                    );
                }
                TransportEvent::Closed => {
                    if self.outcome.is_some() {
                        self.shared.release(&self.native);
                        self.resolve(Err(MessengerError::Transport(
                            "broker connection closed before it was ready".to_string(),
                        )));
                    }
                    break;
                }
            }
        }

        if self.outcome.is_some() {
            self.shared.release(&self.native);
            self.resolve(Err(MessengerError::Transport(
                "broker event stream ended before the connection was ready".to_string(),
            )));
        }
        let _ = self.closed.send(true);
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(result);
        }
    }
}
