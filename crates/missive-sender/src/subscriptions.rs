//! Fan-out of sender events to bounded subscriber queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Publishing never waits: an event that does not fit a subscriber's queue is
/// dropped for that subscriber and counted.
#[derive(Debug)]
pub struct Subscribers<T> {
    name: &'static str,
    capacity: usize,
    senders: Mutex<Vec<mpsc::Sender<T>>>,
    dropped: AtomicU64,
}

impl<T: Clone> Subscribers<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            senders: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: &T) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = self.name,
                    "subscription channel full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Close every queue. Receivers drain what is buffered, then see `None`.
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Events dropped because a queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
