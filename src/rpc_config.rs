//! Public, transport-agnostic RPC configuration.
//!
//! This type contains no transport-specific concepts. Broker addresses live
//! in the endpoint provider; this config only names topics and channels and
//! sets the limits the server and client enforce.

use std::time::Duration;

use crate::{Channel, Result, RpcError, Topic};

/// Topic requests are published to by default.
pub const DEFAULT_REQUEST_TOPIC: &str = "request";

/// Channel servers share on the request topic by default.
pub const DEFAULT_SERVER_CHANNEL: &str = "server";

/// Channel a client consumes its reply topic on by default.
pub const DEFAULT_REPLY_CHANNEL: &str = "client";

/// Concurrent dispatches per server by default.
pub const DEFAULT_CONCURRENCY: usize = 256;

/// RPC topics, channels and limits for one node.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Identifier of this node, used for logging and the default reply topic.
    pub node_id: String,

    /// Topic servers consume requests from and clients publish requests to.
    ///
    /// Default: `"request"`
    pub request_topic: String,

    /// Channel servers consume the request topic on. Servers sharing a
    /// channel share the load.
    ///
    /// Default: `"server"`
    pub server_channel: String,

    /// Topic replies for this client are published to.
    ///
    /// Default: `"reply.{node_id}"`
    pub reply_topic: String,

    /// Channel this client consumes its reply topic on.
    ///
    /// Default: `"client"`
    pub reply_channel: String,

    /// Maximum number of requests a server dispatches concurrently. Also the
    /// consumer's in-flight limit.
    ///
    /// Default: 256
    pub concurrency: usize,

    /// Default deadline for client calls made without an explicit timeout.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Delay before a request whose reply could not be published is
    /// redelivered.
    ///
    /// Default: zero
    pub requeue_delay: Duration,

    /// How long a shutting-down server waits for a cancelled handler to
    /// return before abandoning it. Its message is requeued either way.
    ///
    /// Default: 5 seconds
    pub drain_timeout: Duration,
}

impl RpcConfig {
    /// Create a config with defaults for `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            reply_topic: format!("reply.{node_id}"),
            node_id,
            request_topic: DEFAULT_REQUEST_TOPIC.to_string(),
            server_channel: DEFAULT_SERVER_CHANNEL.to_string(),
            reply_channel: DEFAULT_REPLY_CHANNEL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: Duration::from_secs(30),
            requeue_delay: Duration::ZERO,
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Create a config for `node_id`, overridden from the environment:
    ///
    /// - `RPC_REQUEST_TOPIC`
    /// - `RPC_CONCURRENCY` (positive integer)
    /// - `RPC_REQUEST_TIMEOUT_MS` (positive integer)
    ///
    /// # Errors
    ///
    /// `RpcError::MissingConfig` if a variable is set but empty or unparsable.
    pub fn from_env(node_id: impl Into<String>) -> Result<Self> {
        // ---
        let mut config = Self::new(node_id);

        if let Some(topic) = env_var("RPC_REQUEST_TOPIC")? {
            config.request_topic = topic;
        }
        if let Some(raw) = env_var("RPC_CONCURRENCY")? {
            config.concurrency = parse_positive("RPC_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = env_var("RPC_REQUEST_TIMEOUT_MS")? {
            let ms = parse_positive("RPC_REQUEST_TIMEOUT_MS", &raw)?;
            config.request_timeout = Duration::from_millis(ms as u64);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the request topic.
    pub fn with_request_topic(mut self, topic: impl Into<String>) -> Self {
        self.request_topic = topic.into();
        self
    }

    /// Set the server channel.
    pub fn with_server_channel(mut self, channel: impl Into<String>) -> Self {
        self.server_channel = channel.into();
        self
    }

    /// Set the reply topic.
    pub fn with_reply_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_topic = topic.into();
        self
    }

    /// Set the server concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the default client call timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use queue_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::new("client-1")
    ///     .with_request_timeout(Duration::from_secs(10));
    /// assert_eq!(config.reply_topic, "reply.client-1");
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the redelivery delay for requests whose reply failed to publish.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Set how long shutdown waits for cancelled handlers.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Check values that would make the node unusable.
    ///
    /// # Errors
    ///
    /// - `RpcError::MissingConfig` for an empty topic, channel or node id,
    ///   or zero concurrency
    /// - `RpcError::ConfigConflict` when the reply topic equals the request
    ///   topic (a client would consume its own requests)
    pub fn validate(&self) -> Result<()> {
        // ---
        for (name, value) in [
            ("node_id", &self.node_id),
            ("request_topic", &self.request_topic),
            ("server_channel", &self.server_channel),
            ("reply_topic", &self.reply_topic),
            ("reply_channel", &self.reply_channel),
        ] {
            if value.trim().is_empty() {
                return Err(RpcError::MissingConfig(format!("{name} is empty")));
            }
        }
        if self.concurrency == 0 {
            return Err(RpcError::MissingConfig("concurrency must be at least 1".into()));
        }
        if self.reply_topic == self.request_topic {
            return Err(RpcError::ConfigConflict(format!(
                "reply topic and request topic are both {}",
                self.request_topic
            )));
        }
        Ok(())
    }

    pub(crate) fn request_topic(&self) -> Topic {
        Topic::from(self.request_topic.as_str())
    }

    pub(crate) fn server_channel(&self) -> Channel {
        Channel::from(self.server_channel.as_str())
    }

    pub(crate) fn reply_topic(&self) -> Topic {
        Topic::from(self.reply_topic.as_str())
    }

    pub(crate) fn reply_channel(&self) -> Channel {
        Channel::from(self.reply_channel.as_str())
    }
}

fn env_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => {
            Err(RpcError::MissingConfig(format!("{name} is empty")))
        }
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(_) => Ok(None),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RpcError::MissingConfig(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = RpcConfig::new("n1");
        assert_eq!(config.request_topic, "request");
        assert_eq!(config.server_channel, "server");
        assert_eq!(config.reply_topic, "reply.n1");
        assert_eq!(config.concurrency, 256);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shared_topic() {
        // ---
        let config = RpcConfig::new("n1").with_reply_topic("request");
        assert!(matches!(config.validate(), Err(RpcError::ConfigConflict(_))));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        // ---
        let config = RpcConfig::new("n1").with_concurrency(0);
        assert!(matches!(config.validate(), Err(RpcError::MissingConfig(_))));
    }

    #[test]
    fn test_parse_positive() {
        // ---
        assert_eq!(parse_positive("X", "8").unwrap(), 8);
        assert!(parse_positive("X", "0").is_err());
        assert!(parse_positive("X", "many").is_err());
    }
}
