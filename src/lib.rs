//! RPC semantics over at-least-once pub/sub queues with ack/requeue.
//!
//! Servers consume requests from a shared topic channel, dispatch them to
//! registered handlers on a bounded worker pool, and publish replies to the
//! caller's reply topic. Clients correlate replies with pending calls by
//! correlation id. A request is acknowledged only after its reply has been
//! published; anything interrupted goes back to the broker.
//!
//! Broker addresses come from an endpoint provider, either static or backed
//! by a discovery service, and connections follow provider changes while
//! running.
//!

// Import all sub modules once...
mod client;
mod domain;
mod endpoint;
mod lifecycle;
mod protocol;
mod server;
mod transport;

mod rpc_builder;
mod rpc_config;
mod transport_builder;

mod correlation;
mod error;
mod macros;

use std::sync::{Mutex, MutexGuard};

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::RpcClient;
pub use lifecycle::{shutdown_signal, LifecyclePhase, ServerRuntime};
pub use server::{
    //
    CallContext,
    DispatchCounts,
    DispatchOutcome,
    HandlerError,
    HandlerRegistry,
    HandlerRegistryBuilder,
};

pub use rpc_builder::{RpcClientBuilder, RpcServerBuilder};
pub use rpc_config::{
    //
    RpcConfig,
    DEFAULT_CONCURRENCY,
    DEFAULT_REPLY_CHANNEL,
    DEFAULT_REQUEST_TOPIC,
    DEFAULT_SERVER_CHANNEL,
};
pub use transport_builder::TransportBuilder;

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use protocol::{decode, encode, DecodeError, EncodeError, Envelope, Fault, FaultKind};

pub use endpoint::{
    //
    ChangeCallback,
    Discovery,
    DiscoveryEndpoints,
    EndpointProvider,
    EndpointProviderPtr,
    EndpointSet,
    ManualDiscovery,
    StaticEndpoints,
    DEFAULT_BROKER_ADDRESS,
};

pub use transport::{
    //
    create_memory_transport,
    create_redis_transport,
    BoundConsumer,
    BoundProducer,
    ChannelStats,
    MemoryHub,
    TransportBinding,
};

// --- public re-exports
pub use domain::{
    //
    Channel,
    Consumer,
    ConsumerPtr,
    Delivery,
    Endpoint,
    Producer,
    ProducerPtr,
    Settle,
    Topic,
    Transport,
    TransportPtr,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Every mutex in this crate guards state with no invariants spanning a
/// panic point (tables, queues, replaceable handles), so the data behind a
/// poisoned lock is still usable.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
