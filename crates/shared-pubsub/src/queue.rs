//! # Delivery Queue
//!
//! Pairs values that arrive asynchronously with consumers that arrive
//! asynchronously, in either order.
//!
//! At every stable point at most one of the two sides holds entries: a value
//! goes straight to the oldest waiting consumer, and a consumer takes the
//! oldest pending value, before anything is queued.

use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::oneshot;

/// A consumer waiting for exactly one value.
pub type Consumer<T> = oneshot::Sender<T>;

/// Errors from queue operations after close.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `supply` or `consume` was called after `close`.
    #[error("This queue is no longer accepting values")]
    NotAccepting,

    /// `close` was called twice.
    #[error("This queue is already closed")]
    AlreadyClosed,
}

/// FIFO matching queue with a terminal closed state.
pub struct DeliveryQueue<T> {
    consumers: VecDeque<Consumer<T>>,
    values: VecDeque<T>,
    accepting: bool,
}

impl<T> DeliveryQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumers: VecDeque::new(),
            values: VecDeque::new(),
            accepting: true,
        }
    }

    /// Hand `value` to the oldest waiting consumer, or keep it for the next one.
    ///
    /// Consumers whose receiving side has gone away are skipped.
    ///
    /// # Errors
    ///
    /// `QueueError::NotAccepting` once the queue is closed.
    pub fn supply(&mut self, value: T) -> Result<(), QueueError> {
        if !self.accepting {
            return Err(QueueError::NotAccepting);
        }
        let mut value = value;
        while let Some(consumer) = self.consumers.pop_front() {
            match consumer.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        }
        self.values.push_back(value);
        Ok(())
    }

    /// Give the oldest pending value to `consumer`, or park it until one arrives.
    ///
    /// # Errors
    ///
    /// `QueueError::NotAccepting` once the queue is closed.
    pub fn consume(&mut self, consumer: Consumer<T>) -> Result<(), QueueError> {
        if !self.accepting {
            return Err(QueueError::NotAccepting);
        }
        match self.values.pop_front() {
            Some(value) => {
                // Receiver already gone: the value stays first in line.
                if let Err(value) = consumer.send(value) {
                    self.values.push_front(value);
                }
            }
            None => self.consumers.push_back(consumer),
        }
        Ok(())
    }

    /// Stop accepting, drop pending values and return every waiting consumer.
    ///
    /// The caller resolves the returned consumers with a terminal value.
    ///
    /// # Errors
    ///
    /// `QueueError::AlreadyClosed` on the second call.
    pub fn close(&mut self) -> Result<Vec<Consumer<T>>, QueueError> {
        if !self.accepting {
            return Err(QueueError::AlreadyClosed);
        }
        self.accepting = false;
        self.values.clear();
        Ok(self.consumers.drain(..).collect())
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Values waiting for a consumer.
    #[must_use]
    pub fn pending_values(&self) -> usize {
        self.values.len()
    }

    /// Consumers still waiting for a value.
    #[must_use]
    pub fn waiting_consumers(&self) -> usize {
        self.consumers.iter().filter(|c| !c.is_closed()).count()
    }
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
