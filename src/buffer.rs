//! A bounded hand-off buffer between a single producer (the broker callback) and the
//! application code draining it.
//!
//! What happens when the producer finds the buffer full is an explicit [`FullMode`], chosen by
//! configuration. Items are moved through the buffer, never copied.
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

/// What a write does when the buffer is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullMode {
    /// Suspend the producer until there is room.
    #[default]
    Wait,
    /// Evict the most recently buffered item to make room.
    DropNewest,
    /// Evict the least recently buffered item to make room.
    DropOldest,
    /// Refuse the item being written.
    DropWrite,
}

/// Outcome of a successful [`BufferWriter::write`].
#[derive(Debug, PartialEq, Eq)]
pub enum Written<T> {
    Accepted,
    /// The buffer was full: the item handed back did not make it (or no longer is) in the buffer.
    Dropped(T),
}

/// The producer side has been completed: the item is handed back.
pub struct BufferClosed<T>(pub T);

impl<T> fmt::Debug for BufferClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferClosed(..)")
    }
}

impl<T> fmt::Display for BufferClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the buffer no longer accepts writes")
    }
}

impl<T> std::error::Error for BufferClosed<T> {}

struct State<T> {
    queue: VecDeque<T>,
    completed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    mode: FullMode,
    readable: Notify,
    writable: Notify,
    drained: Notify,
}

/// Create a buffer holding at most `capacity` items (at least one).
pub fn bounded<T>(capacity: usize, mode: FullMode) -> (BufferWriter<T>, BufferReader<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            completed: false,
        }),
        capacity,
        mode,
        readable: Notify::new(),
        writable: Notify::new(),
        drained: Notify::new(),
    });
    (
        BufferWriter {
            shared: Arc::clone(&shared),
        },
        BufferReader { shared },
    )
}

/// The producer half.
pub struct BufferWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BufferWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BufferWriter<T> {
    /// Write `item`, applying the configured [`FullMode`] if the buffer is at capacity.
    ///
    /// Fails, handing the item back, once [`complete`](Self::complete) has been called.
    pub async fn write(&self, item: T) -> Result<Written<T>, BufferClosed<T>> {
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.completed {
                    return Err(BufferClosed(item));
                }
                if state.queue.len() < self.shared.capacity {
                    state.queue.push_back(item);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(Written::Accepted);
                }
                let evicted = match self.shared.mode {
                    FullMode::Wait => None,
                    FullMode::DropWrite => return Ok(Written::Dropped(item)),
                    FullMode::DropNewest => state.queue.pop_back(),
                    FullMode::DropOldest => state.queue.pop_front(),
                };
                if let Some(evicted) = evicted {
                    state.queue.push_back(item);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(Written::Dropped(evicted));
                }
            }
            notified.await;
        }
    }

    /// Signal that no more items will be written.
    ///
    /// Returns `false` if the buffer had already been completed.
    pub fn complete(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.completed {
            return false;
        }
        state.completed = true;
        let drained = state.queue.is_empty();
        drop(state);
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        if drained {
            self.shared.drained.notify_waiters();
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }
}

/// The consumer half. Clones share the same queue: each item is handed to exactly one reader.
pub struct BufferReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BufferReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BufferReader<T> {
    /// Wait until an item is available (`true`) or the buffer is completed and empty (`false`).
    pub async fn wait_to_read(&self) -> bool {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if !state.queue.is_empty() {
                    return true;
                }
                if state.completed {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_read(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        let item = state.queue.pop_front()?;
        let drained = state.completed && state.queue.is_empty();
        drop(state);
        self.shared.writable.notify_waiters();
        if drained {
            self.shared.drained.notify_waiters();
        }
        Some(item)
    }

    /// Take the oldest item, waiting for one if necessary.
    ///
    /// Returns `None` once the buffer is completed and empty.
    pub async fn read(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_read() {
                return Some(item);
            }
            if !self.wait_to_read().await {
                return None;
            }
        }
    }

    /// Resolves once the buffer is completed and every item has been read.
    pub async fn completion(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Drop every buffered item without handing it to a reader. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let mut state = self.shared.state.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        let drained = state.completed;
        drop(state);
        self.shared.writable.notify_waiters();
        if drained {
            self.shared.drained.notify_waiters();
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }

    /// Completed and empty: nothing will ever be read again.
    pub fn is_drained(&self) -> bool {
        let state = self.shared.state.lock();
        state.completed && state.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn full_mode(&self) -> FullMode {
        self.shared.mode
    }
}
