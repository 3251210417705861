// src/endpoint/provider.rs

//! Endpoint sets and the provider capability.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{Endpoint, Result, RpcError};

/// Broker address used when nothing else is configured.
pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:4150";

/// Immutable snapshot of where the brokers are.
///
/// A change always produces a new `EndpointSet`; readers holding an
/// `Arc<EndpointSet>` never observe a partial update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    broker_address: String,
    lookup_addresses: Option<Vec<String>>,
}

impl EndpointSet {
    /// A set with only a broker address.
    pub fn new(broker_address: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            lookup_addresses: None,
        }
    }

    /// A set with a broker address and lookup addresses. An empty lookup
    /// list is the same as none.
    pub fn with_lookups(broker_address: impl Into<String>, lookups: Vec<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            lookup_addresses: if lookups.is_empty() {
                None
            } else {
                Some(lookups)
            },
        }
    }

    /// Address producers publish to.
    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    /// Lookup service addresses, in order, if any.
    pub fn lookup_addresses(&self) -> Option<&[String]> {
        self.lookup_addresses.as_deref()
    }

    /// Endpoints a consumer attaches to: the lookup services when present,
    /// otherwise the broker directly.
    pub fn consumer_endpoints(&self) -> Vec<Endpoint> {
        match &self.lookup_addresses {
            Some(lookups) => lookups.iter().cloned().map(Endpoint::Lookup).collect(),
            None => vec![Endpoint::Broker(self.broker_address.clone())],
        }
    }
}

/// Supplies the current [`EndpointSet`] and announces changes.
///
/// Selected once at construction time; the transport binding only talks to
/// this capability, never to the variant behind it.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// Resolve the current endpoint set.
    ///
    /// # Errors
    ///
    /// `RpcError::Discovery` when a discovery-backed provider cannot resolve.
    async fn resolve(&self) -> Result<Arc<EndpointSet>>;

    /// Subscribe to endpoint changes. `None` when the provider never changes.
    fn watch(&self) -> Option<watch::Receiver<Arc<EndpointSet>>>;
}

/// Shared provider pointer.
pub type EndpointProviderPtr = Arc<dyn EndpointProvider>;

/// Fixed endpoints. Never notifies.
#[derive(Debug, Clone)]
pub struct StaticEndpoints {
    set: Arc<EndpointSet>,
}

impl StaticEndpoints {
    pub fn new(set: EndpointSet) -> Self {
        Self { set: Arc::new(set) }
    }

    /// A single local broker at [`DEFAULT_BROKER_ADDRESS`], no lookups.
    pub fn local() -> Self {
        Self::new(EndpointSet::new(DEFAULT_BROKER_ADDRESS))
    }

    /// Build from `RPC_BROKER_ADDRESS` and comma-separated `RPC_LOOKUP_ADDRESSES`.
    ///
    /// A missing broker address falls back to [`DEFAULT_BROKER_ADDRESS`].
    ///
    /// # Errors
    ///
    /// `RpcError::MissingConfig` if a variable is set but empty.
    pub fn from_env() -> Result<Self> {
        // ---
        let broker = match std::env::var("RPC_BROKER_ADDRESS") {
            Ok(addr) if addr.trim().is_empty() => {
                return Err(RpcError::MissingConfig("RPC_BROKER_ADDRESS is empty".into()));
            }
            Ok(addr) => addr.trim().to_string(),
            Err(_) => DEFAULT_BROKER_ADDRESS.to_string(),
        };

        let lookups = match std::env::var("RPC_LOOKUP_ADDRESSES") {
            Ok(raw) => parse_address_list(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self::new(EndpointSet::with_lookups(broker, lookups)))
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpoints {
    async fn resolve(&self) -> Result<Arc<EndpointSet>> {
        Ok(self.set.clone())
    }

    fn watch(&self) -> Option<watch::Receiver<Arc<EndpointSet>>> {
        None
    }
}

fn parse_address_list(raw: &str) -> Result<Vec<String>> {
    let addrs: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if addrs.is_empty() {
        return Err(RpcError::MissingConfig("RPC_LOOKUP_ADDRESSES is empty".into()));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_consumer_endpoints_prefer_lookups() {
        // ---
        let set = EndpointSet::with_lookups("b:1", vec!["l:1".into(), "l:2".into()]);
        assert_eq!(
            set.consumer_endpoints(),
            vec![Endpoint::Lookup("l:1".into()), Endpoint::Lookup("l:2".into())]
        );

        let direct = EndpointSet::new("b:1");
        assert_eq!(direct.consumer_endpoints(), vec![Endpoint::Broker("b:1".into())]);
    }

    #[test]
    fn test_empty_lookups_are_absent() {
        // ---
        let set = EndpointSet::with_lookups("b:1", Vec::new());
        assert_eq!(set.lookup_addresses(), None);
    }

    #[tokio::test]
    async fn test_static_never_notifies() {
        // ---
        let provider = StaticEndpoints::local();
        let set = provider.resolve().await.unwrap();
        assert_eq!(set.broker_address(), DEFAULT_BROKER_ADDRESS);
        assert!(set.lookup_addresses().is_none());
        assert!(provider.watch().is_none());
    }

    #[test]
    fn test_parse_address_list() {
        // ---
        assert_eq!(
            parse_address_list(" a:1, b:2 ,").unwrap(),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
        assert!(parse_address_list(" , ").is_err());
    }
}
