// src/transport/binding.rs

//! Transport binding.
//!
//! Opens producers and consumers against the addresses an
//! [`EndpointProvider`](crate::EndpointProvider) supplies, and follows the
//! provider when it announces a new [`EndpointSet`]:
//!
//! - a producer is rebuilt against the new broker address and swapped in;
//!   the old producer is stopped once nothing can pick it up any more
//! - a consumer connects to added endpoints before disconnecting removed
//!   ones, so there is no window with nothing attached
//!
//! A failed reconnect is logged and the previous connection stays in use.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    Channel,
    ConsumerPtr,
    Delivery,
    Endpoint,
    EndpointProviderPtr,
    EndpointSet,
    ProducerPtr,
    Result,
    Topic,
    TransportPtr,
};

/// Pairs a transport with the endpoint provider that tells it where to go.
#[derive(Clone)]
pub struct TransportBinding {
    transport: TransportPtr,
    provider: EndpointProviderPtr,
}

impl TransportBinding {
    pub fn new(transport: TransportPtr, provider: EndpointProviderPtr) -> Self {
        Self {
            transport,
            provider,
        }
    }

    pub fn transport_id(&self) -> &str {
        self.transport.transport_id()
    }

    /// Resolve the current endpoint set through the provider.
    ///
    /// # Errors
    ///
    /// `RpcError::Discovery` from a discovery-backed provider.
    pub async fn resolve(&self) -> Result<Arc<EndpointSet>> {
        self.provider.resolve().await
    }

    /// Open a producer against `set`'s broker address.
    ///
    /// # Errors
    ///
    /// `RpcError::Connect` if the broker cannot be reached.
    pub async fn open_producer(&self, set: &Arc<EndpointSet>) -> Result<BoundProducer> {
        // ---
        let producer = self.transport.producer(set.broker_address()).await?;
        let current = Arc::new(RwLock::new(producer));
        let token = CancellationToken::new();

        let watcher = self.provider.watch().map(|rx| {
            let task = ProducerWatcher {
                transport: self.transport.clone(),
                current: current.clone(),
                applied: set.clone(),
            };
            tokio::spawn(follow(rx, token.clone(), task))
        });

        Ok(BoundProducer {
            current,
            token,
            watcher: std::sync::Mutex::new(watcher),
        })
    }

    /// Create a consumer for `topic`/`channel` and attach it to `set`'s
    /// consumer endpoints: the lookup services when present, else the broker.
    ///
    /// # Errors
    ///
    /// `RpcError::Connect` if any initial endpoint cannot be reached. The
    /// consumer is stopped before the error is returned.
    pub async fn open_consumer(
        &self,
        set: &Arc<EndpointSet>,
        topic: Topic,
        channel: Channel,
        max_in_flight: usize,
    ) -> Result<BoundConsumer> {
        // ---
        let consumer = self.transport.consumer(topic, channel, max_in_flight).await?;

        let mut connected = BTreeSet::new();
        for endpoint in set.consumer_endpoints() {
            if let Err(err) = consumer.connect(&endpoint).await {
                consumer.stop().await;
                return Err(err);
            }
            connected.insert(endpoint);
        }

        let token = CancellationToken::new();
        let watcher = self.provider.watch().map(|rx| {
            let task = ConsumerWatcher {
                transport_id: self.transport.transport_id().to_string(),
                consumer: consumer.clone(),
                connected,
            };
            tokio::spawn(follow(rx, token.clone(), task))
        });

        Ok(BoundConsumer {
            consumer,
            token,
            watcher: std::sync::Mutex::new(watcher),
        })
    }
}

/// Reacts to a newly published endpoint set.
#[async_trait]
trait Reconcile: Send {
    async fn reconcile(&mut self, next: Arc<EndpointSet>);
}

/// Feed every endpoint set the provider publishes to `state` until `token`
/// is cancelled or the provider goes away. The value current at subscription
/// time is checked too, so a change racing with startup is not missed.
async fn follow<R: Reconcile>(
    mut rx: watch::Receiver<Arc<EndpointSet>>,
    token: CancellationToken,
    mut state: R,
) {
    // ---
    loop {
        let next = rx.borrow_and_update().clone();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = state.reconcile(next) => {}
        }
        tokio::select! {
            _ = token.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn take_watcher(slot: &std::sync::Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    crate::lock_ignore_poison(slot).take()
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// A producer that follows broker address changes.
pub struct BoundProducer {
    current: Arc<RwLock<ProducerPtr>>,
    token: CancellationToken,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BoundProducer {
    fn producer(&self) -> ProducerPtr {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Broker address currently published to.
    pub fn address(&self) -> String {
        self.producer().address().to_string()
    }

    /// Publish through the current producer.
    ///
    /// # Errors
    ///
    /// `RpcError::Transport` if the broker rejects the publish or the
    /// producer has been stopped.
    pub async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        self.producer().publish(topic, body).await
    }

    /// Stop following endpoint changes and stop the producer. Idempotent.
    pub async fn stop(&self) {
        // ---
        self.token.cancel();
        if let Some(watcher) = take_watcher(&self.watcher) {
            let _ = watcher.await;
        }
        self.producer().stop().await;
    }
}

struct ProducerWatcher {
    transport: TransportPtr,
    current: Arc<RwLock<ProducerPtr>>,
    applied: Arc<EndpointSet>,
}

#[async_trait]
impl Reconcile for ProducerWatcher {
    async fn reconcile(&mut self, next: Arc<EndpointSet>) {
        // ---
        if self.applied.broker_address() == next.broker_address() {
            return;
        }

        let address = next.broker_address();
        let fresh = match self.transport.producer(address).await {
            Ok(producer) => producer,
            Err(_err) => {
                log_error!(
                    "{}: producer reconnect to {address} failed, staying on {}: {_err}",
                    self.transport.transport_id(),
                    self.applied.broker_address()
                );
                return;
            }
        };

        let old = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, fresh)
        };
        old.stop().await;

        log_info!(
            "{}: producer moved from {} to {address}",
            self.transport.transport_id(),
            old.address()
        );
        self.applied = next;
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// A consumer that follows endpoint changes.
pub struct BoundConsumer {
    consumer: ConsumerPtr,
    token: CancellationToken,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BoundConsumer {
    pub fn topic(&self) -> &Topic {
        self.consumer.topic()
    }

    pub fn channel(&self) -> &Channel {
        self.consumer.channel()
    }

    /// Wait for the next inbound message. `None` once stopped.
    pub async fn recv(&self) -> Option<Delivery> {
        self.consumer.recv().await
    }

    /// Stop following endpoint changes and stop accepting new messages.
    /// Deliveries already handed out remain valid. Idempotent.
    pub async fn stop(&self) {
        // ---
        self.token.cancel();
        if let Some(watcher) = take_watcher(&self.watcher) {
            let _ = watcher.await;
        }
        self.consumer.stop().await;
    }
}

struct ConsumerWatcher {
    transport_id: String,
    consumer: ConsumerPtr,
    connected: BTreeSet<Endpoint>,
}

#[async_trait]
impl Reconcile for ConsumerWatcher {
    async fn reconcile(&mut self, next: Arc<EndpointSet>) {
        // ---
        let desired: BTreeSet<Endpoint> = next.consumer_endpoints().into_iter().collect();
        if desired == self.connected {
            return;
        }

        let mut complete = true;
        for endpoint in desired.difference(&self.connected).cloned().collect::<Vec<_>>() {
            match self.consumer.connect(&endpoint).await {
                Ok(()) => {
                    self.connected.insert(endpoint);
                }
                Err(_err) => {
                    complete = false;
                    log_error!("{}: connect to {endpoint} failed: {_err}", self.transport_id);
                }
            }
        }

        if !complete {
            log_error!(
                "{}: keeping previous endpoints after failed reconnect",
                self.transport_id
            );
            return;
        }

        for endpoint in self.connected.difference(&desired).cloned().collect::<Vec<_>>() {
            if let Err(_err) = self.consumer.disconnect(&endpoint).await {
                log_error!("{}: disconnect from {endpoint} failed: {_err}", self.transport_id);
            }
            self.connected.remove(&endpoint);
        }

        log_debug!(
            "{}: consumer {}/{} now attached to {:?}",
            self.transport_id,
            self.consumer.topic(),
            self.consumer.channel(),
            self.connected
        );
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_transport, DiscoveryEndpoints, ManualDiscovery, MemoryHub};
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_producer_follows_broker_change() {
        // ---
        let hub = MemoryHub::new();
        hub.add_broker("b:1");
        hub.add_broker("b:2");

        let discovery = ManualDiscovery::new("b:1");
        let provider = Arc::new(DiscoveryEndpoints::new(discovery.clone()).await.unwrap());
        let binding = TransportBinding::new(create_memory_transport("t", hub.clone()), provider);

        let set = binding.resolve().await.unwrap();
        let producer = binding.open_producer(&set).await.unwrap();
        assert_eq!(producer.address(), "b:1");

        discovery.set_broker_address("b:2");
        eventually(|| producer.address() == "b:2").await;
        producer.stop().await;
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_producer() {
        // ---
        let hub = MemoryHub::new();
        hub.add_broker("b:1");

        let discovery = ManualDiscovery::new("b:1");
        let provider = Arc::new(DiscoveryEndpoints::new(discovery.clone()).await.unwrap());
        let binding = TransportBinding::new(create_memory_transport("t", hub.clone()), provider);

        let set = binding.resolve().await.unwrap();
        let producer = binding.open_producer(&set).await.unwrap();

        discovery.set_broker_address("missing:9");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(producer.address(), "b:1");
        producer.publish(&"t".into(), Bytes::new()).await.unwrap();
        producer.stop().await;
    }

    #[tokio::test]
    async fn test_consumer_moves_to_new_broker() {
        // ---
        let hub = MemoryHub::new();
        hub.add_broker("b:1");
        hub.add_broker("b:2");

        let discovery = ManualDiscovery::new("b:1");
        let provider = Arc::new(DiscoveryEndpoints::new(discovery.clone()).await.unwrap());
        let binding = TransportBinding::new(create_memory_transport("t", hub.clone()), provider);

        let set = binding.resolve().await.unwrap();
        let consumer = binding
            .open_consumer(&set, "t".into(), "c".into(), 4)
            .await
            .unwrap();

        discovery.set_broker_address("b:2");
        let transport = create_memory_transport("pub", hub.clone());
        let publisher = transport.producer("b:2").await.unwrap();

        // the watcher reconnects asynchronously; keep publishing until the
        // consumer picks one up from the new broker
        let delivery = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                publisher.publish(&"t".into(), Bytes::from_static(b"moved")).await.unwrap();
                tokio::select! {
                    d = consumer.recv() => break d,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(delivery.body().as_ref(), b"moved");
        delivery.ack();
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_consumer_prefers_lookups() {
        // ---
        let hub = MemoryHub::new();
        hub.add_broker("b:1");
        hub.register_lookup("l:1", vec!["b:1".into()]);

        let provider = Arc::new(crate::StaticEndpoints::new(EndpointSet::with_lookups(
            "unused:0",
            vec!["l:1".into()],
        )));
        let binding = TransportBinding::new(create_memory_transport("t", hub.clone()), provider);
        let set = binding.resolve().await.unwrap();
        let consumer = binding
            .open_consumer(&set, "t".into(), "c".into(), 1)
            .await
            .unwrap();

        let publisher = create_memory_transport("pub", hub.clone())
            .producer("b:1")
            .await
            .unwrap();
        publisher.publish(&"t".into(), Bytes::from_static(b"via lookup")).await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.body().as_ref(), b"via lookup");
        delivery.ack();
        consumer.stop().await;
    }
}
