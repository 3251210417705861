//! Transport builder for creating transport instances.
//!
//! Provides a fluent builder API that selects the transport implementation
//! by name.

use std::sync::Arc;

use crate::{
    // ---
    create_memory_transport,
    create_redis_transport,
    log_debug,
    MemoryHub,
    Result,
    RpcError,
    TransportPtr,
    DEFAULT_BROKER_ADDRESS,
};

/// Builder for creating transport instances.
///
/// # Examples
///
/// ## In-process transports sharing one hub
/// ```
/// use queue_rpc::{MemoryHub, TransportBuilder, DEFAULT_BROKER_ADDRESS};
///
/// # fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// hub.add_broker(DEFAULT_BROKER_ADDRESS);
///
/// let server = TransportBuilder::new()
///     .transport_id("server")
///     .memory_hub(hub.clone())
///     .build()?;
/// let client = TransportBuilder::new()
///     .transport_id("client")
///     .memory_hub(hub)
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Redis Streams
/// ```no_run
/// use queue_rpc::TransportBuilder;
///
/// # fn example() -> queue_rpc::Result<()> {
/// let transport = TransportBuilder::new()
///     .transport_id("server")
///     .transport_type("redis")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct TransportBuilder {
    transport_id: Option<String>,
    transport_type: Option<String>,
    memory_hub: Option<Arc<MemoryHub>>,
}

impl TransportBuilder {
    /// Create a new transport builder.
    pub fn new() -> Self {
        Self {
            transport_id: None,
            transport_type: None,
            memory_hub: None,
        }
    }

    /// Set the transport id (required). Used as the log prefix and, for
    /// Redis, the consumer name within a group.
    pub fn transport_id(mut self, id: impl Into<String>) -> Self {
        self.transport_id = Some(id.into());
        self
    }

    /// Set explicit transport type.
    ///
    /// Valid values: `"memory"`, `"redis"`
    ///
    /// If not specified, uses `"redis"` when the `transport_redis` feature is
    /// enabled and no memory hub was given, otherwise `"memory"`.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Use an existing in-process hub. Implies the memory transport.
    ///
    /// Without one, the memory transport gets a private hub with a single
    /// broker at [`DEFAULT_BROKER_ADDRESS`].
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.memory_hub = Some(hub);
        self
    }

    /// Build the transport (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `transport_id` is missing (`RpcError::MissingConfig`)
    /// - a memory hub is combined with a non-memory transport type
    ///   (`RpcError::ConfigConflict`)
    /// - the transport type is unrecognized or not compiled in
    ///   (`RpcError::Transport`)
    pub fn build(self) -> Result<TransportPtr> {
        // ---
        let transport_id = self
            .transport_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RpcError::MissingConfig("transport_id".into()))?;

        let transport_type = match (self.transport_type.as_deref(), &self.memory_hub) {
            (Some(flag), Some(_)) if flag != "memory" => {
                return Err(RpcError::ConfigConflict(format!(
                    "a memory hub cannot be used with transport_type {flag}"
                )));
            }
            (Some(flag), _) => flag.to_string(),
            (None, Some(_)) => "memory".to_string(),
            (None, None) if cfg!(feature = "transport_redis") => "redis".to_string(),
            (None, None) => "memory".to_string(),
        };
        log_debug!("{transport_id}: building {transport_type} transport");

        match transport_type.as_str() {
            "memory" => {
                let hub = self.memory_hub.unwrap_or_else(|| {
                    let hub = MemoryHub::new();
                    hub.add_broker(DEFAULT_BROKER_ADDRESS);
                    hub
                });
                Ok(create_memory_transport(transport_id, hub))
            }
            "redis" => create_redis_transport(transport_id),
            other => Err(RpcError::Transport(format!(
                "unrecognized transport_type: {other}, valid values: memory, redis"
            ))),
        }
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
