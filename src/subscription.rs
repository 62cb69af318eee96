// src/subscription.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerQueue, QueueState};
use crate::errors::{MessengerError, Result};
use crate::lock;

const UNSUBSCRIBED: u8 = 1;
const DESTROYED: u8 = 2;
const CLOSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Open,
    Disposing,
    Disposed,
    /// Teardown gave up; the consumer may still be registered on the broker.
    Failed,
}

/// How hard a subscription tries to tear itself down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposePolicy {
    pub retry_delay: Duration,
    /// Total teardown attempts, the first one included.
    pub max_retries: u32,
}

impl Default for DisposePolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

/// A live consumer on a private queue.
///
/// Cloning shares the same consumer; disposing any clone disposes all of them.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<dyn BrokerQueue>,
    consumer_tag: String,
    policy: DisposePolicy,
    disposed: AtomicBool,
    state: Mutex<SubscriptionState>,
    // highest teardown step that has completed
    progress: AtomicU8,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(
        queue: Arc<dyn BrokerQueue>,
        consumer_tag: String,
        policy: DisposePolicy,
        delivery_task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                consumer_tag,
                policy,
                disposed: AtomicBool::new(false),
                state: Mutex::new(SubscriptionState::Open),
                progress: AtomicU8::new(0),
                delivery_task: Mutex::new(delivery_task),
            }),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    pub fn queue_name(&self) -> &str {
        self.inner.queue.name()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SubscriptionState {
        *lock(&self.inner.state)
    }

    /// Unsubscribes the consumer, then deletes and closes its queue.
    ///
    /// Only the first call does any work; later calls resolve `true` at once.
    /// A failed teardown rejects this call and keeps retrying in the background
    /// until the policy's attempt budget is spent.
    pub async fn dispose(&self) -> Result<bool> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            warn!(consumer_tag = %inner.consumer_tag, "Subscription already disposed");
            return Ok(true);
        }
        inner.set_state(SubscriptionState::Disposing);

        if inner.policy.max_retries == 0 {
            let err = inner.retries_exceeded(0);
            inner.set_state(SubscriptionState::Failed);
            return Err(err);
        }

        match inner.teardown().await {
            Ok(()) => {
                inner.set_state(SubscriptionState::Disposed);
                debug!(consumer_tag = %inner.consumer_tag, queue = inner.queue.name(), "Subscription disposed");
                Ok(true)
            }
            Err(err) if err.is_terminal() => {
                error!(consumer_tag = %inner.consumer_tag, error = %err, "Subscription cannot be disposed");
                inner.set_state(SubscriptionState::Failed);
                Err(err)
            }
            Err(err) => {
                warn!(
                    consumer_tag = %inner.consumer_tag,
                    attempt = 1,
                    error = %err,
                    "Failed to dispose subscription, retrying in background"
                );
                tokio::spawn(inner.clone().retry_disposal());
                Err(err)
            }
        }
    }
}

impl Inner {
    fn set_state(&self, state: SubscriptionState) {
        *lock(&self.state) = state;
    }

    fn retries_exceeded(&self, attempts: u32) -> MessengerError {
        let err = MessengerError::DisposeRetriesExceeded {
            consumer_tag: self.consumer_tag.clone(),
            attempts,
        };
        error!(consumer_tag = %self.consumer_tag, attempts, "{err}");
        err
    }

    async fn teardown(&self) -> Result<()> {
        let state = self.queue.state();
        if state != QueueState::Open {
            return Err(MessengerError::InvalidQueueState {
                queue: self.queue.name().to_owned(),
                state,
            });
        }

        if self.progress.load(Ordering::SeqCst) < UNSUBSCRIBED {
            self.queue.unsubscribe(&self.consumer_tag).await?;
            self.progress.store(UNSUBSCRIBED, Ordering::SeqCst);
            if let Some(task) = lock(&self.delivery_task).take() {
                task.abort();
            }
        }
        if self.progress.load(Ordering::SeqCst) < DESTROYED {
            self.queue.destroy().await?;
            self.progress.store(DESTROYED, Ordering::SeqCst);
        }
        if self.progress.load(Ordering::SeqCst) < CLOSED {
            self.queue.close().await?;
            self.progress.store(CLOSED, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn retry_disposal(self: Arc<Self>) {
        for attempt in 2..=self.policy.max_retries {
            tokio::time::sleep(self.policy.retry_delay).await;
            match self.teardown().await {
                Ok(()) => {
                    info!(consumer_tag = %self.consumer_tag, attempt, "Subscription disposed after retry");
                    self.set_state(SubscriptionState::Disposed);
                    return;
                }
                Err(err) if err.is_terminal() => {
                    error!(consumer_tag = %self.consumer_tag, attempt, error = %err, "Giving up on subscription disposal");
                    self.set_state(SubscriptionState::Failed);
                    return;
                }
                Err(err) => {
                    warn!(consumer_tag = %self.consumer_tag, attempt, error = %err, "Subscription disposal attempt failed");
                }
            }
        }
        self.retries_exceeded(self.policy.max_retries);
        self.set_state(SubscriptionState::Failed);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.inner.consumer_tag)
            .field("queue", &self.inner.queue.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, QueueOptions};

    async fn subscription(broker: &MemoryBroker, policy: DisposePolicy) -> Subscription {
        let (connection, _events) = broker.connect("test");
        let queue = connection
            .queue("", QueueOptions::private())
            .await
            .expect("queue");
        let (tag, _deliveries) = queue.subscribe().await.expect("subscribe");
        Subscription::new(queue, tag, policy, None)
    }

    fn fast(max_retries: u32) -> DisposePolicy {
        DisposePolicy {
            retry_delay: Duration::from_millis(5),
            max_retries,
        }
    }

    #[tokio::test]
    async fn second_dispose_does_not_touch_the_queue() {
        let broker = MemoryBroker::new();
        let subscription = subscription(&broker, fast(3)).await;

        assert!(subscription.dispose().await.expect("first"));
        assert!(subscription.clone().dispose().await.expect("second"));

        let stats = broker.stats();
        assert_eq!((stats.unsubscribes, stats.destroys, stats.closes), (1, 1, 1));
        assert_eq!(subscription.state(), SubscriptionState::Disposed);
        assert!(subscription.is_disposed());
    }

    #[tokio::test]
    async fn zero_retries_gives_up_immediately() {
        let broker = MemoryBroker::new();
        let subscription = subscription(&broker, fast(0)).await;

        let err = subscription.dispose().await.expect_err("dispose");
        assert!(matches!(err, MessengerError::DisposeRetriesExceeded { attempts: 0, .. }));
        assert_eq!(subscription.state(), SubscriptionState::Failed);
        assert_eq!(broker.stats().unsubscribes, 0);
    }

    #[tokio::test]
    async fn closed_queue_is_rejected_without_retry() {
        let broker = MemoryBroker::new();
        let subscription = subscription(&broker, fast(3)).await;
        broker.close_queue(subscription.queue_name());

        let err = subscription.dispose().await.expect_err("dispose");
        assert!(matches!(
            err,
            MessengerError::InvalidQueueState { state: QueueState::Closed, .. }
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.stats().unsubscribes, 0);
        assert_eq!(subscription.state(), SubscriptionState::Failed);
    }

    #[tokio::test]
    async fn failed_unsubscribe_is_retried_in_background() {
        let broker = MemoryBroker::new();
        let subscription = subscription(&broker, fast(3)).await;
        broker.fail_unsubscribes(1);

        assert!(subscription.dispose().await.is_err());
        assert_eq!(subscription.state(), SubscriptionState::Disposing);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = broker.stats();
        assert_eq!(stats.unsubscribes, 2);
        assert_eq!((stats.destroys, stats.closes), (1, 1));
        assert_eq!(subscription.state(), SubscriptionState::Disposed);
        assert_eq!(broker.consumer_count(), 0);
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_budget() {
        let broker = MemoryBroker::new();
        let subscription = subscription(&broker, fast(3)).await;
        broker.fail_unsubscribes(10);

        assert!(subscription.dispose().await.is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(broker.stats().unsubscribes, 3);
        assert_eq!(subscription.state(), SubscriptionState::Failed);
    }
}
