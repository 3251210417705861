// src/domain/delivery.rs

//! In-flight message handle.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::log_warn;

/// Transport-side half of a delivery: settles the message at the broker.
///
/// Implementations are consumed by the call, so each message is settled at
/// most once. Failures are the transport's to log; the broker's own
/// redelivery covers a lost acknowledgment.
pub trait Settle: Send {
    /// Permanently remove the message from its channel.
    fn ack(self: Box<Self>);

    /// Return the message to its channel for redelivery after `delay`.
    fn requeue(self: Box<Self>, delay: Duration);
}

/// A message handed out by a [`Consumer`](crate::Consumer).
///
/// Must be settled exactly once, with [`ack`](Delivery::ack) or
/// [`requeue`](Delivery::requeue). Both consume the delivery, so settling
/// twice does not compile. A delivery dropped without being settled is
/// requeued and a warning is logged.
pub struct Delivery {
    id: String,
    body: Bytes,
    attempts: u32,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    /// Build a delivery. Called by transports.
    pub fn new(id: impl Into<String>, body: Bytes, attempts: u32, settle: Box<dyn Settle>) -> Self {
        Self {
            id: id.into(),
            body,
            attempts,
            settle: Some(settle),
        }
    }

    /// Transport-assigned message id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Message body as published.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Delivery attempt, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Acknowledge: the message will not be delivered again.
    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.ack();
        }
    }

    /// Requeue: the message returns to its channel for redelivery.
    pub fn requeue(mut self, delay: Duration) {
        if let Some(settle) = self.settle.take() {
            settle.requeue(delay);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            log_warn!("message {} dropped without ack or requeue, requeueing", self.id);
            settle.requeue(Duration::ZERO);
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("len", &self.body.len())
            .field("attempts", &self.attempts)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}
