use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Default number of events a consumer may fall behind before the fetcher blocks.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Returned by [`EventQueue::push`] once the queue is closed; hands the item back.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("queue closed")]
pub struct QueueClosed<T>(pub T);

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO between the fetcher and one consumer.
///
/// `push` blocks while full, `pop` blocks while empty. After `close`, pushes
/// fail immediately and pops drain what is left before returning `None`.
pub struct EventQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(QueueClosed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Wakes every waiter; idempotent.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
