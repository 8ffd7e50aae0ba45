//! Bounded request queue between session handles and the dispatcher.
//!
//! Urgent requests (trouble code reads and clears) are served before
//! normal ones. When the queue is full the oldest normal request is
//! evicted and handed back to the producer so it can be failed; a queue
//! holding only urgent requests rejects new work instead.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::warn;

/// Default number of requests the queue holds
pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    Normal,
}

/// Why a push was rejected. The item is handed back.
#[derive(Debug)]
pub enum PushError<T> {
    /// Every slot holds an urgent request
    Full(T),
    /// The dispatcher has shut down
    Closed(T),
}

#[derive(Debug)]
struct QueueState<T> {
    urgent: VecDeque<T>,
    normal: VecDeque<T>,
    closed: bool,
}

impl<T> QueueState<T> {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }
}

/// Multi-producer, single-consumer bounded queue with two priorities
#[derive(Debug)]
pub struct RequestQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue `item`. Returns the evicted request, if one had to make room.
    pub fn push(&self, item: T, priority: Priority) -> Result<Option<T>, PushError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }

        let mut evicted = None;
        if state.len() >= self.capacity {
            match state.normal.pop_front() {
                Some(oldest) => {
                    warn!("Request queue full, dropping oldest deferred request");
                    metrics::counter!("obd_queue_dropped_total").increment(1);
                    evicted = Some(oldest);
                }
                None => {
                    warn!("Request queue full of urgent requests");
                    return Err(PushError::Full(item));
                }
            }
        }

        match priority {
            Priority::Urgent => state.urgent.push_back(item),
            Priority::Normal => state.normal.push_back(item),
        }
        drop(state);
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Next request without waiting, urgent first
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        state.urgent.pop_front().or_else(|| state.normal.pop_front())
    }

    /// Wait for the next request. `None` once the queue is closed and empty.
    ///
    /// Cancel safe: an item is only removed when it is returned.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.urgent.pop_front().or_else(|| state.normal.pop_front()) {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further pushes and hand back everything still queued
    pub fn close(&self) -> Vec<T> {
        let mut state = self.lock();
        state.closed = true;
        let mut drained: Vec<T> = state.urgent.drain(..).collect();
        drained.extend(state.normal.drain(..));
        drop(state);
        self.notify.notify_one();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
