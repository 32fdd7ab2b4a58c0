//! Bounded FIFO inbox of delegate events.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;

use crate::domain::models::delegate::DelegateEvent;

/// Outcome of a bounded push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event was enqueued.
    Delivered,
    /// The queue stayed full for the whole timeout.
    Full,
    /// The consuming side is gone.
    Closed,
}

/// A bounded FIFO queue owned by one service. Producers (delegate sinks,
/// external injection) share the sender; the service worker is the single
/// consumer.
pub struct Inbox {
    tx: mpsc::Sender<DelegateEvent>,
    rx: Mutex<mpsc::Receiver<DelegateEvent>>,
    capacity: usize,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue with backpressure: waits up to `timeout` for space. A zero
    /// timeout means a single immediate attempt.
    pub async fn push(&self, event: DelegateEvent, timeout: Duration) -> PushOutcome {
        if timeout.is_zero() {
            return match self.tx.try_send(event) {
                Ok(()) => PushOutcome::Delivered,
                Err(TrySendError::Full(_)) => PushOutcome::Full,
                Err(TrySendError::Closed(_)) => PushOutcome::Closed,
            };
        }
        match tokio::time::timeout(timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(event);
                PushOutcome::Delivered
            }
            Ok(Err(_)) => PushOutcome::Closed,
            Err(_) => PushOutcome::Full,
        }
    }

    /// Dequeue the next event, waiting up to `timeout`.
    pub async fn pop(&self, timeout: Duration) -> Option<DelegateEvent> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}
