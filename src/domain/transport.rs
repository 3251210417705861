// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the contract the RPC layer needs from an
//! at-least-once, acknowledging pub/sub transport. It intentionally avoids
//! any reference to concrete protocols, brokers, or client libraries.
//!
//! The model follows topic/channel semantics:
//!
//! - A publish to a topic is copied to every channel on that topic.
//! - Consumers attached to the same channel share its messages.
//! - Every delivered message is in flight until it is acknowledged
//!   (removed for good) or requeued (returned for redelivery).
//!
//! Concrete implementations live under `src/transport/`. The in-memory
//! transport is the reference implementation of these semantics.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::delivery::Delivery;
use crate::Result;

/// A topic name: the destination of a publish.
///
/// Immutable, cheap to clone, and safe to share across threads. The domain
/// layer makes no assumptions about topic syntax.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(pub Arc<str>);

impl<T> From<T> for Topic
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Topic(value.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel name: an independently acknowledging subscriber group on a topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(pub Arc<str>);

impl<T> From<T> for Channel
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Channel(value.into())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something a consumer can connect to.
///
/// A consumer either attaches to a broker directly or asks a lookup service
/// which brokers carry its topic and attaches to those.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Broker(String),
    Lookup(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Broker(addr) => write!(f, "broker {addr}"),
            Endpoint::Lookup(addr) => write!(f, "lookup {addr}"),
        }
    }
}

/// Publish capability bound to a single broker address.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Broker address this producer publishes to.
    fn address(&self) -> &str;

    /// Publish a message body to a topic.
    ///
    /// Returns once the broker has accepted the message. Fails with
    /// `RpcError::Transport` if the producer is stopped or the broker
    /// rejects the publish.
    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()>;

    /// Stop the producer. Further publishes fail. Idempotent.
    async fn stop(&self);
}

/// Subscribe-with-acknowledgment capability for one topic/channel pair.
///
/// Messages are pulled with [`recv`](Consumer::recv) rather than pushed to a
/// callback, so the caller decides how many are processed concurrently. At
/// most `max_in_flight` deliveries handed out by this consumer are unsettled
/// at any time.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Topic this consumer is subscribed to.
    fn topic(&self) -> &Topic;

    /// Channel this consumer belongs to.
    fn channel(&self) -> &Channel;

    /// Start receiving from an endpoint. Connecting twice is a no-op.
    async fn connect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Stop receiving from an endpoint. Unknown endpoints are a no-op.
    async fn disconnect(&self, endpoint: &Endpoint) -> Result<()>;

    /// Wait for the next message. Returns `None` once the consumer is stopped.
    async fn recv(&self) -> Option<Delivery>;

    /// Stop accepting new messages.
    ///
    /// After this returns no further deliveries are handed out; messages
    /// fetched from the broker but not yet received are requeued.
    /// Deliveries already handed out stay valid and must still be settled.
    /// Idempotent.
    async fn stop(&self);
}

/// Factory for producers and consumers of one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier of this transport instance, used for logging.
    fn transport_id(&self) -> &str;

    /// Open a producer connected to `broker_address`.
    ///
    /// Fails with `RpcError::Connect` if the broker cannot be reached.
    async fn producer(&self, broker_address: &str) -> Result<ProducerPtr>;

    /// Create a consumer for `topic`/`channel`. It receives nothing until
    /// connected to at least one endpoint.
    async fn consumer(
        &self,
        topic: Topic,
        channel: Channel,
        max_in_flight: usize,
    ) -> Result<ConsumerPtr>;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;

/// Shared producer pointer.
pub type ProducerPtr = Arc<dyn Producer>;

/// Shared consumer pointer.
pub type ConsumerPtr = Arc<dyn Consumer>;
