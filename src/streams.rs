//! Bounded in-process queues used for every stream this crate exposes: pool errors,
//! publish notifications and consumed messages.
//!
//! Two send flavours cover the two back-pressure policies in use:
//! - [`BoundedQueue::force_push`] never blocks; once the queue is full it evicts the
//!   oldest entry and counts the eviction. Error and notification streams use this so
//!   a slow reader can never stall a broker-facing task.
//! - [`BoundedQueue::push`] waits for free space. The consumer's message stream uses
//!   this so that back-pressure propagates to the broker via the prefetch window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// A fixed-capacity multi-producer/multi-consumer queue.
///
/// All methods take `&self`; the queue is meant to be shared behind an `Arc`.
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    evicted: AtomicU64,
    readable: Notify,
    writable: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries. A zero capacity is bumped to
    /// one so that `force_push` always retains the most recent entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            evicted: AtomicU64::new(0),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue without ever blocking. When the queue is full, the oldest entry is
    /// evicted to make room and the eviction counter is incremented.
    pub fn force_push(&self, item: T) {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() == self.capacity {
                items.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.readable.notify_one();
    }

    /// Enqueue only if there is room, handing the item back otherwise.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() == self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for free space when the queue is full.
    pub async fn push(&self, mut item: T) {
        loop {
            match self.try_push(item) {
                Ok(()) => return,
                Err(rejected) => item = rejected,
            }
            self.writable.notified().await;
        }
    }

    /// Wait until space may have been freed. Pair with [`try_push`](Self::try_push)
    /// to build a blocking send that can be cancelled without losing the item.
    pub async fn space(&self) {
        self.writable.notified().await;
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let popped = self.items.lock().unwrap().pop_front();
        if popped.is_some() {
            self.writable.notify_one();
        }
        popped
    }

    /// Dequeue, waiting until an entry is available.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.readable.notified().await;
        }
    }

    /// Remove and return everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().unwrap().drain(..).collect();
        if !drained.is_empty() {
            self.writable.notify_one();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many entries have been evicted by `force_push` since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
