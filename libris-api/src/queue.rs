//! Bounded FIFO queue of pending reservations.
//!
//! Producers are request handlers; the only consumer is the batcher,
//! which serializes drains. Enqueue never blocks: a full queue is
//! backpressure, reported to the client as 503.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::model::QueueEntry;

/// Error surface of queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("reservation queue is full (max: {max})")]
    Full { max: usize },
}

/// Thread-safe bounded FIFO of [`QueueEntry`] records.
pub struct ReservationQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    max: usize,
}

impl ReservationQueue {
    pub fn new(max: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max.min(1024))),
            max,
        }
    }

    /// Add an entry at the tail. Fails fast when the queue is at its
    /// configured bound.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max {
            return Err(QueueError::Full { max: self.max });
        }
        entries.push_back(entry);
        Ok(())
    }

    /// Put a retried entry back at the head so it runs first on the next
    /// tick. Exempt from the bound: the entry was already admitted once,
    /// and backpressure only applies to new work.
    pub async fn requeue_front(&self, entry: QueueEntry) {
        let mut entries = self.entries.lock().await;
        entries.push_front(entry);
    }

    /// Remove and return up to `max_n` entries in FIFO order.
    pub async fn drain(&self, max_n: usize) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock().await;
        let n = max_n.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Current number of queued entries.
    pub async fn depth(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
