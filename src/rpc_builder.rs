//! RPC server and client builders.
//!
//! Provide a fluent API that assembles a transport, an endpoint provider,
//! an [`RpcConfig`] and (for servers) the handler table, then runs the
//! lifecycle startup sequence.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    // ---
    CallContext,
    EndpointProviderPtr,
    HandlerError,
    HandlerRegistry,
    HandlerRegistryBuilder,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    ServerRuntime,
    StaticEndpoints,
    TransportBinding,
    TransportPtr,
};

/// Settings shared by both builders.
struct Common {
    transport: TransportPtr,
    endpoints: Option<EndpointProviderPtr>,
    config: Option<RpcConfig>,
    node_id: Option<String>,
    request_topic: Option<String>,
    request_timeout: Option<Duration>,
}

impl Common {
    fn new(transport: TransportPtr) -> Self {
        Self {
            transport,
            endpoints: None,
            config: None,
            node_id: None,
            request_topic: None,
            request_timeout: None,
        }
    }

    fn has_overrides(&self) -> bool {
        self.node_id.is_some() || self.request_topic.is_some() || self.request_timeout.is_some()
    }

    /// Resolve the config and binding. An explicit config excludes the
    /// individual setters.
    fn finish(self) -> Result<(TransportBinding, RpcConfig)> {
        // ---
        let overridden = self.has_overrides();
        let config = match self.config {
            Some(_) if overridden => {
                return Err(RpcError::ConfigConflict(
                    "Cannot use both config() and individual settings (node_id, request_topic, request_timeout)"
                        .into(),
                ));
            }
            Some(config) => config,
            None => {
                let node_id = self
                    .node_id
                    .unwrap_or_else(|| self.transport.transport_id().to_string());
                let mut config = RpcConfig::new(node_id);
                if let Some(topic) = self.request_topic {
                    config = config.with_request_topic(topic);
                }
                if let Some(timeout) = self.request_timeout {
                    config = config.with_request_timeout(timeout);
                }
                config
            }
        };
        config.validate()?;

        let endpoints = self
            .endpoints
            .unwrap_or_else(|| Arc::new(StaticEndpoints::local()));
        Ok((TransportBinding::new(self.transport, endpoints), config))
    }
}

/// Builder for starting an RPC server.
///
/// # Example
///
/// ```
/// use queue_rpc::{MemoryHub, RpcServerBuilder, TransportBuilder, DEFAULT_BROKER_ADDRESS};
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// hub.add_broker(DEFAULT_BROKER_ADDRESS);
/// let transport = TransportBuilder::new()
///     .transport_id("math-server")
///     .memory_hub(hub)
///     .build()?;
///
/// let server = RpcServerBuilder::new(transport)
///     .concurrency(16)
///     .register("Echo", |_ctx, body| async move { Ok(body) })
///     .start()
///     .await?;
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcServerBuilder {
    // ---
    common: Common,
    concurrency: Option<usize>,
    drain_timeout: Option<Duration>,
    handlers: HandlerRegistryBuilder,
}

impl RpcServerBuilder {
    /// Create a server builder. The node id defaults to the transport id and
    /// the endpoints to [`StaticEndpoints::local`].
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            common: Common::new(transport),
            concurrency: None,
            drain_timeout: None,
            handlers: HandlerRegistry::builder(),
        }
    }

    /// Set the endpoint provider.
    pub fn endpoints(mut self, provider: EndpointProviderPtr) -> Self {
        self.common.endpoints = Some(provider);
        self
    }

    /// Use a complete config. Cannot be combined with the individual
    /// setters below.
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.common.config = Some(config);
        self
    }

    /// Override the node id.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.common.node_id = Some(id.into());
        self
    }

    /// Set the request topic.
    pub fn request_topic(mut self, topic: impl Into<String>) -> Self {
        self.common.request_topic = Some(topic.into());
        self
    }

    /// Set the worker count.
    ///
    /// Default: 256.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set how long shutdown waits for cancelled handlers.
    ///
    /// Default: 5s.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Register a raw byte handler.
    pub fn register<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.handlers = self.handlers.register(method, handler);
        self
    }

    /// Register a JSON handler.
    pub fn register_typed<F, Fut, TReq, TResp>(
        mut self,
        method: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(CallContext, TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TResp, HandlerError>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        self.handlers = self.handlers.register_typed(method, handler);
        self
    }

    /// Start the server (consumes self).
    ///
    /// # Errors
    ///
    /// - `RpcError::ConfigConflict` if `config()` was combined with individual
    ///   settings
    /// - anything [`ServerRuntime::start`] returns
    pub async fn start(self) -> Result<ServerRuntime> {
        // ---
        let explicit = self.common.config.is_some();
        if explicit && (self.concurrency.is_some() || self.drain_timeout.is_some()) {
            return Err(RpcError::ConfigConflict(
                "Cannot use both config() and individual settings (concurrency, drain_timeout)"
                    .into(),
            ));
        }

        let (binding, mut config) = self.common.finish()?;
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(timeout) = self.drain_timeout {
            config = config.with_drain_timeout(timeout);
        }

        ServerRuntime::start(binding, self.handlers.build(), config).await
    }
}

/// Builder for starting an RPC client.
///
/// # Example
///
/// ```no_run
/// use queue_rpc::{RpcClientBuilder, StaticEndpoints, TransportBuilder};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let transport = TransportBuilder::new()
///     .transport_id("math-client")
///     .transport_type("redis")
///     .build()?;
///
/// let client = RpcClientBuilder::new(transport)
///     .endpoints(Arc::new(StaticEndpoints::from_env()?))
///     .request_timeout(Duration::from_secs(2))
///     .start()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcClientBuilder {
    common: Common,
}

impl RpcClientBuilder {
    /// Create a client builder. The node id defaults to the transport id and
    /// the endpoints to [`StaticEndpoints::local`].
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            common: Common::new(transport),
        }
    }

    /// Set the endpoint provider.
    pub fn endpoints(mut self, provider: EndpointProviderPtr) -> Self {
        self.common.endpoints = Some(provider);
        self
    }

    /// Use a complete config. Cannot be combined with the individual
    /// setters below.
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.common.config = Some(config);
        self
    }

    /// Override the node id. Also names the default reply topic.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.common.node_id = Some(id.into());
        self
    }

    /// Set the request topic.
    pub fn request_topic(mut self, topic: impl Into<String>) -> Self {
        self.common.request_topic = Some(topic.into());
        self
    }

    /// Set the default call timeout.
    ///
    /// Default: 30s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.common.request_timeout = Some(timeout);
        self
    }

    /// Start the client (consumes self).
    ///
    /// # Errors
    ///
    /// - `RpcError::ConfigConflict` if `config()` was combined with individual
    ///   settings
    /// - anything [`RpcClient::start`] returns
    pub async fn start(self) -> Result<RpcClient> {
        let (binding, config) = self.common.finish()?;
        RpcClient::start(binding, config).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport, MemoryHub};

    fn transport() -> TransportPtr {
        create_memory_transport("builder-test", MemoryHub::new())
    }

    #[test]
    fn test_config_conflicts_with_setters() {
        // ---
        let mut common = Common::new(transport());
        common.config = Some(RpcConfig::new("n1"));
        common.node_id = Some("n2".into());
        assert!(common.has_overrides());
        assert!(matches!(common.finish(), Err(RpcError::ConfigConflict(_))));
    }

    #[test]
    fn test_node_id_defaults_to_transport_id() {
        // ---
        let (binding, config) = Common::new(transport()).finish().unwrap();
        assert_eq!(config.node_id, "builder-test");
        assert_eq!(config.reply_topic, "reply.builder-test");
        assert_eq!(binding.transport_id(), "builder-test");
    }

    #[tokio::test]
    async fn test_server_concurrency_conflicts_with_config() {
        // ---
        let result = RpcServerBuilder::new(transport())
            .config(RpcConfig::new("n1"))
            .concurrency(4)
            .start()
            .await;
        assert!(matches!(result, Err(RpcError::ConfigConflict(_))));
    }

    #[tokio::test]
    async fn test_client_fails_on_unknown_broker() {
        // ---
        // the hub has no broker at the default address
        let result = RpcClientBuilder::new(transport()).start().await;
        assert!(matches!(result, Err(RpcError::Connect(_))));
    }
}
