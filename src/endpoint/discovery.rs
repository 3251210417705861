// src/endpoint/discovery.rs

//! Discovery-backed endpoint provider.
//!
//! The discovery collaborator is an external service that knows where the
//! brokers currently are. [`DiscoveryEndpoints`] asks it once at
//! construction, then re-asks whenever the collaborator signals a change and
//! publishes the result as a fresh [`EndpointSet`] through a watch channel.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::provider::{EndpointProvider, EndpointSet};
use crate::{lock_ignore_poison, log_debug, log_error, log_info, Result, RpcError};

/// Callback invoked by a discovery collaborator when its answers change.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// External service locating broker and lookup addresses.
///
/// Failures are explicit `RpcError::Discovery` values, never silent defaults.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current broker address.
    async fn broker_address(&self) -> Result<String>;

    /// Current lookup service addresses; empty when none are known.
    async fn lookup_addresses(&self) -> Result<Vec<String>>;

    /// Register a callback fired whenever either answer may have changed.
    fn subscribe(&self, on_change: ChangeCallback);
}

/// Endpoint provider backed by a [`Discovery`] collaborator.
pub struct DiscoveryEndpoints {
    discovery: Arc<dyn Discovery>,
    tx: Arc<watch::Sender<Arc<EndpointSet>>>,
    refresh_task: JoinHandle<()>,
}

impl DiscoveryEndpoints {
    /// Resolve the initial endpoint set and start following changes.
    ///
    /// # Errors
    ///
    /// Propagates the collaborator's `RpcError::Discovery` so the caller can
    /// decide whether to retry or fail startup.
    pub async fn new(discovery: Arc<dyn Discovery>) -> Result<Self> {
        // ---
        let initial = resolve_from(discovery.as_ref()).await?;
        log_info!(
            "discovery resolved broker {} lookups {:?}",
            initial.broker_address(),
            initial.lookup_addresses()
        );

        let (tx, _rx) = watch::channel(Arc::new(initial));
        let tx = Arc::new(tx);

        // Notify coalesces bursts of change callbacks into one refresh.
        let changed = Arc::new(Notify::new());
        {
            let changed = changed.clone();
            discovery.subscribe(Box::new(move || changed.notify_one()));
        }

        let refresh_task = {
            let discovery = discovery.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    changed.notified().await;
                    if let Err(_err) = refresh_into(discovery.as_ref(), &tx).await {
                        log_error!("discovery refresh failed, keeping previous endpoints: {_err}");
                    }
                }
            })
        };

        Ok(Self {
            discovery,
            tx,
            refresh_task,
        })
    }

    /// Re-resolve now. Returns whether the endpoint set changed.
    ///
    /// # Errors
    ///
    /// `RpcError::Discovery` from the collaborator. The current set is kept.
    pub async fn refresh(&self) -> Result<bool> {
        refresh_into(self.discovery.as_ref(), &self.tx).await
    }

    /// Snapshot of the current endpoint set.
    pub fn current(&self) -> Arc<EndpointSet> {
        self.tx.borrow().clone()
    }
}

impl Drop for DiscoveryEndpoints {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

#[async_trait]
impl EndpointProvider for DiscoveryEndpoints {
    async fn resolve(&self) -> Result<Arc<EndpointSet>> {
        Ok(self.current())
    }

    fn watch(&self) -> Option<watch::Receiver<Arc<EndpointSet>>> {
        Some(self.tx.subscribe())
    }
}

async fn resolve_from(discovery: &dyn Discovery) -> Result<EndpointSet> {
    let broker = discovery.broker_address().await?;
    let lookups = discovery.lookup_addresses().await?;
    Ok(EndpointSet::with_lookups(broker, lookups))
}

async fn refresh_into(
    discovery: &dyn Discovery,
    tx: &watch::Sender<Arc<EndpointSet>>,
) -> Result<bool> {
    // ---
    let next = resolve_from(discovery).await?;
    let changed = tx.send_if_modified(|current| {
        if **current == next {
            false
        } else {
            *current = Arc::new(next);
            true
        }
    });

    if changed {
        log_info!("discovery endpoints changed: {:?}", *tx.borrow());
    } else {
        log_debug!("discovery refresh: endpoints unchanged");
    }
    Ok(changed)
}

struct ManualState {
    broker_address: String,
    lookup_addresses: Vec<String>,
    failure: Option<String>,
}

/// A [`Discovery`] whose answers are set by hand.
///
/// Useful for operators wiring addresses from their own control plane and
/// for exercising endpoint changes in tests. Every setter fires the
/// registered change callbacks.
pub struct ManualDiscovery {
    state: Mutex<ManualState>,
    subscribers: Mutex<Vec<ChangeCallback>>,
}

impl ManualDiscovery {
    pub fn new(broker_address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualState {
                broker_address: broker_address.into(),
                lookup_addresses: Vec::new(),
                failure: None,
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_broker_address(&self, addr: impl Into<String>) {
        lock_ignore_poison(&self.state).broker_address = addr.into();
        self.notify();
    }

    pub fn set_lookup_addresses(&self, addrs: Vec<String>) {
        lock_ignore_poison(&self.state).lookup_addresses = addrs;
        self.notify();
    }

    /// Make every resolution fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<String>) {
        lock_ignore_poison(&self.state).failure = reason;
        self.notify();
    }

    fn notify(&self) {
        for callback in lock_ignore_poison(&self.subscribers).iter() {
            callback();
        }
    }

    fn check(&self) -> Result<()> {
        match &lock_ignore_poison(&self.state).failure {
            Some(reason) => Err(RpcError::Discovery(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Discovery for ManualDiscovery {
    async fn broker_address(&self) -> Result<String> {
        self.check()?;
        Ok(lock_ignore_poison(&self.state).broker_address.clone())
    }

    async fn lookup_addresses(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock_ignore_poison(&self.state).lookup_addresses.clone())
    }

    fn subscribe(&self, on_change: ChangeCallback) {
        lock_ignore_poison(&self.subscribers).push(on_change);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_failure_propagates() {
        // ---
        let discovery = ManualDiscovery::new("b:1");
        discovery.set_failure(Some("registry unreachable".into()));

        let err = DiscoveryEndpoints::new(discovery).await.err().unwrap();
        assert!(matches!(err, RpcError::Discovery(ref m) if m == "registry unreachable"));
    }

    #[tokio::test]
    async fn test_change_callback_publishes_new_set() {
        // ---
        let discovery = ManualDiscovery::new("b:1");
        let provider = DiscoveryEndpoints::new(discovery.clone()).await.unwrap();
        let mut rx = provider.watch().unwrap();

        let before = provider.resolve().await.unwrap();
        discovery.set_broker_address("b:2");

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("no change notification")
            .unwrap();

        let after = rx.borrow_and_update().clone();
        assert_eq!(after.broker_address(), "b:2");
        // the old snapshot is untouched
        assert_eq!(before.broker_address(), "b:1");
    }

    #[tokio::test]
    async fn test_refresh_reports_unchanged() {
        // ---
        let discovery = ManualDiscovery::new("b:1");
        let provider = DiscoveryEndpoints::new(discovery).await.unwrap();
        assert!(!provider.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_current_set() {
        // ---
        let discovery = ManualDiscovery::new("b:1");
        let provider = DiscoveryEndpoints::new(discovery.clone()).await.unwrap();

        discovery.set_failure(Some("gone".into()));
        assert!(matches!(
            provider.refresh().await,
            Err(RpcError::Discovery(_))
        ));
        assert_eq!(provider.current().broker_address(), "b:1");
    }
}
