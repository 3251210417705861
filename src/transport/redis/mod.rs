//! Redis transports.
//!
//! Currently supports:
//! - streams - Redis Streams via the redis library (streams.rs)

#[cfg(feature = "transport_redis")]
mod streams;

#[cfg(feature = "transport_redis")]
pub use streams::create_transport as create_redis_transport;

#[cfg(not(feature = "transport_redis"))]
pub fn create_redis_transport(_transport_id: impl Into<String>) -> crate::Result<crate::TransportPtr> {
    Err(crate::RpcError::Transport(
        "transport_redis feature is not enabled".into(),
    ))
}
