// src/broker/memory.rs
//! In-process broker with topic/direct/fanout routing.
//!
//! Backs tests and single-process deployments. Connect, bind, consume and
//! unsubscribe faults can be scripted, and every queue teardown operation is
//! counted so callers can assert on them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::topic::routes;
use super::{
    Broker, BrokerConnection, BrokerQueue, Delivery, DeliveryFields, DeliveryStream,
    ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions, QueueState, TransportError,
    TransportEvent, TransportEvents,
};
use crate::lock;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Operation counters observed by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: usize,
    pub exchange_declarations: HashMap<String, usize>,
    pub published: usize,
    pub unsubscribes: usize,
    pub destroys: usize,
    pub closes: usize,
}

#[derive(Default)]
struct Faults {
    refused_connects: u32,
    reset_connects: u32,
    withhold_ready: bool,
    failing_binds: u32,
    failing_consumes: u32,
    failing_unsubscribes: u32,
    declare_latency: Duration,
}

#[derive(Default)]
struct QueueEntry {
    state: Arc<AtomicU8>,
    bindings: Vec<(String, String)>,
    consumers: Vec<(String, stream_channel::UnboundedSender<Delivery>)>,
    backlog: VecDeque<Delivery>,
    next_consumer: usize,
}

impl QueueEntry {
    fn dispatch(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            let (tag, sender) = &self.consumers[index];
            if let Some(fields) = delivery.fields.as_mut() {
                fields.consumer_tag = tag.clone();
            }
            match sender.unbounded_send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return;
                }
                Err(rejected) => {
                    // receiver went away without unsubscribing
                    delivery = rejected.into_inner();
                    self.consumers.remove(index);
                }
            }
        }
        self.backlog.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueEntry>,
    connections: Vec<mpsc::UnboundedSender<TransportEvent>>,
    faults: Faults,
    stats: BrokerStats,
}

impl BrokerState {
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        let targets: Vec<String> = if exchange.is_empty() {
            // default exchange delivers straight to the queue named by the key
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect()
        } else {
            let kind = *self.exchanges.get(exchange).ok_or_else(|| {
                TransportError::Other(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            self.queues
                .iter()
                .filter(|(_, entry)| {
                    entry.bindings.iter().any(|(bound, pattern)| {
                        bound == exchange && routes(kind, pattern, routing_key)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        self.stats.published += 1;
        if targets.is_empty() {
            debug!(exchange, routing_key, "Dropping unroutable message");
        }
        for name in targets {
            if let Some(entry) = self.queues.get_mut(&name) {
                entry.dispatch(Delivery {
                    fields: Some(DeliveryFields {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        consumer_tag: String::new(),
                    }),
                    properties: Some(properties.clone()),
                    content: content.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Cloneable handle to a shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connection attempts are refused before one succeeds.
    pub fn refuse_connects(&self, count: u32) {
        lock(&self.state).faults.refused_connects = count;
    }

    /// The next `count` connection attempts see a transient reset first.
    pub fn reset_connects(&self, count: u32) {
        lock(&self.state).faults.reset_connects = count;
    }

    /// The next connection never reports ready; it stays pending until it is
    /// disconnected.
    pub fn withhold_ready(&self) {
        lock(&self.state).faults.withhold_ready = true;
    }

    /// The next `count` bind calls fail.
    pub fn fail_binds(&self, count: u32) {
        lock(&self.state).faults.failing_binds = count;
    }

    /// The next `count` consume (subscribe) calls fail.
    pub fn fail_consumes(&self, count: u32) {
        lock(&self.state).faults.failing_consumes = count;
    }

    /// The next `count` unsubscribe calls fail.
    pub fn fail_unsubscribes(&self, count: u32) {
        lock(&self.state).faults.failing_unsubscribes = count;
    }

    pub fn set_declare_latency(&self, latency: Duration) {
        lock(&self.state).faults.declare_latency = latency;
    }

    /// Reports `error` on every live connection.
    pub fn inject_error(&self, error: TransportError) {
        let mut state = lock(&self.state);
        state
            .connections
            .retain(|events| events.send(TransportEvent::Error(error.clone())).is_ok());
    }

    /// Marks a queue closed from the broker side, as a server-initiated channel close would.
    pub fn close_queue(&self, name: &str) {
        if let Some(entry) = lock(&self.state).queues.get(name) {
            entry.state.store(CLOSED, Ordering::SeqCst);
        }
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.state).stats.clone()
    }

    pub fn exchange_declarations(&self, name: &str) -> usize {
        lock(&self.state)
            .stats
            .exchange_declarations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.state).queues.len()
    }

    /// Consumers still registered across all queues.
    pub fn consumer_count(&self) -> usize {
        lock(&self.state)
            .queues
            .values()
            .map(|entry| entry.consumers.len())
            .sum()
    }
}

impl Broker for MemoryBroker {
    fn connect(&self, label: &str) -> (Arc<dyn BrokerConnection>, TransportEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.stats.connects += 1;

        let resets = std::mem::take(&mut state.faults.reset_connects);
        for _ in 0..resets {
            let _ = events.send(TransportEvent::Error(TransportError::ConnectionReset));
        }
        let refusals = std::mem::take(&mut state.faults.refused_connects);
        for attempt in 1..=refusals {
            let _ = events.send(TransportEvent::Error(TransportError::Refused(format!(
                "memory broker refused attempt {attempt}"
            ))));
        }
        if !std::mem::take(&mut state.faults.withhold_ready) {
            let _ = events.send(TransportEvent::Ready);
        }
        state.connections.push(events.clone());

        debug!(label, "Memory broker connection opened");
        let connection = MemoryConnection {
            state: self.state.clone(),
            events,
            open: AtomicBool::new(true),
            owned_queues: Arc::default(),
        };
        (Arc::new(connection), receiver)
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: AtomicBool,
    // exclusive queues still alive; dropped from the broker on disconnect
    owned_queues: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let latency = lock(&self.state).faults.declare_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        *state
            .stats
            .exchange_declarations
            .entry(name.to_owned())
            .or_default() += 1;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TransportError::Other(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<Arc<dyn BrokerQueue>, TransportError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        let queue_state = {
            let mut state = lock(&self.state);
            let entry = state.queues.entry(name.clone()).or_default();
            entry.state.store(OPEN, Ordering::SeqCst);
            entry.state.clone()
        };
        let owner = options.exclusive.then(|| {
            let mut owned = lock(&self.owned_queues);
            if !owned.contains(&name) {
                owned.push(name.clone());
            }
            self.owned_queues.clone()
        });

        Ok(Arc::new(MemoryQueue {
            name,
            broker: self.state.clone(),
            state: queue_state,
            owner,
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.state).route(exchange, routing_key, content, properties)
    }

    async fn disconnect(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let owned = std::mem::take(&mut *lock(&self.owned_queues));
        {
            let mut state = lock(&self.state);
            for name in owned {
                if let Some(entry) = state.queues.remove(&name) {
                    entry.state.store(CLOSED, Ordering::SeqCst);
                }
            }
            state.connections.retain(|events| !events.same_channel(&self.events));
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

struct MemoryQueue {
    name: String,
    broker: Arc<Mutex<BrokerState>>,
    state: Arc<AtomicU8>,
    owner: Option<Arc<Mutex<Vec<String>>>>,
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> QueueState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => QueueState::Open,
            CLOSING => QueueState::Closing,
            _ => QueueState::Closed,
        }
    }

    async fn bind(&self, exchange: &str, pattern: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.broker);
        if state.faults.failing_binds > 0 {
            state.faults.failing_binds -= 1;
            return Err(TransportError::Other(format!(
                "queue.bind failed for {}",
                self.name
            )));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Other(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let entry = state
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| TransportError::Other(format!("NOT_FOUND - no queue '{}'", self.name)))?;
        entry.bindings.push((exchange.to_owned(), pattern.to_owned()));
        Ok(())
    }

    async fn subscribe(&self) -> Result<(String, DeliveryStream), TransportError> {
        let mut state = lock(&self.broker);
        if state.faults.failing_consumes > 0 {
            state.faults.failing_consumes -= 1;
            return Err(TransportError::Other(format!(
                "basic.consume failed for {}",
                self.name
            )));
        }
        let entry = state
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| TransportError::Other(format!("NOT_FOUND - no queue '{}'", self.name)))?;

        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (sender, receiver) = stream_channel::unbounded();
        entry.consumers.push((tag.clone(), sender));
        let backlog: Vec<Delivery> = entry.backlog.drain(..).collect();
        for delivery in backlog {
            entry.dispatch(delivery);
        }
        Ok((tag, receiver.boxed()))
    }

    async fn unsubscribe(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.broker);
        state.stats.unsubscribes += 1;
        if state.faults.failing_unsubscribes > 0 {
            state.faults.failing_unsubscribes -= 1;
            return Err(TransportError::Other(format!(
                "basic.cancel failed for {consumer_tag}"
            )));
        }
        if let Some(entry) = state.queues.get_mut(&self.name) {
            entry.consumers.retain(|(tag, _)| tag != consumer_tag);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.broker);
        state.stats.destroys += 1;
        state.queues.remove(&self.name);
        drop(state);
        if let Some(owner) = &self.owner {
            lock(owner).retain(|name| name != &self.name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        lock(&self.broker).stats.closes += 1;
        self.state.store(CLOSED, Ordering::SeqCst);
        Ok(())
    }
}
