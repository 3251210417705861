//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait and the binding that points them at the endpoints an
//! `EndpointProvider` supplies. Broker-backed transports are hidden behind
//! feature flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod binding;
mod memory;
mod redis;

pub use binding::{BoundConsumer, BoundProducer, TransportBinding};
pub use memory::{create_memory_transport, ChannelStats, MemoryHub};
pub use redis::create_redis_transport;
