// src/transport/memory.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer:
//!
//! - A [`MemoryHub`] holds any number of named brokers and lookup services.
//! - A publish to a topic is copied to every channel on that topic. Messages
//!   published before any channel exists are held by the topic and handed to
//!   the first channel created.
//! - Consumers attached to the same channel share its messages.
//! - A delivered message stays in flight until it is acknowledged (gone for
//!   good) or requeued (back in the channel, attempt count incremented).
//! - A consumer never holds more than `max_in_flight` undelivered messages;
//!   anything it has not taken yet stays ready in the channel.
//!
//! ## Non-Goals
//!
//! Persistence, network behavior, and the message timeouts of a real broker
//! are not emulated. Broker outages are simulated with
//! [`MemoryHub::set_broker_online`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    log_warn,
    Channel,
    Consumer,
    ConsumerPtr,
    Delivery,
    Endpoint,
    Producer,
    ProducerPtr,
    Result,
    RpcError,
    Settle,
    Topic,
    Transport,
    TransportPtr,
};

/// Counters for one channel on one broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub in_flight: usize,
    /// Total acknowledgments.
    pub acked: u64,
    /// Total requeues.
    pub requeued: u64,
}

#[derive(Clone)]
struct Message {
    id: String,
    body: Bytes,
    attempts: u32,
}

#[derive(Default)]
struct ChannelState {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, Message>,
    acked: u64,
    requeued: u64,
}

/// Message queue of a single channel, shared by every consumer attached to it.
#[derive(Default)]
struct ChannelQueue {
    state: Mutex<ChannelState>,
    available: Notify,
}

impl ChannelQueue {
    fn push(&self, msg: Message) {
        lock_ignore_poison(&self.state).ready.push_back(msg);
        self.available.notify_one();
    }

    /// Move the next ready message in flight and return it with its
    /// attempt count bumped.
    fn take(&self) -> Option<Message> {
        let mut state = lock_ignore_poison(&self.state);
        let mut msg = state.ready.pop_front()?;
        msg.attempts += 1;
        state.in_flight.insert(msg.id.clone(), msg.clone());
        Some(msg)
    }

    fn ack(&self, id: &str) {
        let mut state = lock_ignore_poison(&self.state);
        if state.in_flight.remove(id).is_some() {
            state.acked += 1;
        }
    }

    fn requeue(&self, id: &str) {
        {
            let mut state = lock_ignore_poison(&self.state);
            let Some(msg) = state.in_flight.remove(id) else {
                return;
            };
            state.requeued += 1;
            state.ready.push_back(msg);
        }
        self.available.notify_one();
    }

    fn stats(&self) -> ChannelStats {
        let state = lock_ignore_poison(&self.state);
        ChannelStats {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            acked: state.acked,
            requeued: state.requeued,
        }
    }
}

#[derive(Default)]
struct TopicState {
    channels: HashMap<Channel, Arc<ChannelQueue>>,
    // held until the first channel is created
    backlog: VecDeque<Message>,
}

/// One simulated broker.
struct Broker {
    address: String,
    topics: Mutex<HashMap<Topic, TopicState>>,
    next_id: AtomicU64,
    online: AtomicBool,
}

impl Broker {
    fn new(address: String) -> Self {
        Self {
            address,
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        // ---
        if !self.is_online() {
            return Err(RpcError::Transport(format!(
                "broker {} is unavailable",
                self.address
            )));
        }

        let id = format!(
            "{}-{}",
            self.address,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let msg = Message {
            id,
            body,
            attempts: 0,
        };

        let mut topics = lock_ignore_poison(&self.topics);
        let state = topics.entry(topic.clone()).or_default();
        if state.channels.is_empty() {
            state.backlog.push_back(msg);
            return Ok(());
        }
        for queue in state.channels.values() {
            queue.push(msg.clone());
        }
        Ok(())
    }

    fn channel(&self, topic: &Topic, channel: &Channel) -> Arc<ChannelQueue> {
        // ---
        let mut topics = lock_ignore_poison(&self.topics);
        let state = topics.entry(topic.clone()).or_default();
        if let Some(queue) = state.channels.get(channel) {
            return queue.clone();
        }

        let queue = Arc::new(ChannelQueue::default());
        while let Some(msg) = state.backlog.pop_front() {
            queue.push(msg);
        }
        state.channels.insert(channel.clone(), queue.clone());
        queue
    }

    fn stats(&self, topic: &Topic, channel: &Channel) -> Option<ChannelStats> {
        let topics = lock_ignore_poison(&self.topics);
        topics
            .get(topic)
            .and_then(|state| state.channels.get(channel))
            .map(|queue| queue.stats())
    }
}

/// Shared broker fabric for the in-memory transport.
///
/// Simulates a set of brokers and lookup services within a single process.
/// All transports created from the same hub see the same brokers, exactly as
/// nodes pointed at the same cluster would. Construct a fresh hub per test to
/// keep parallel tests isolated.
///
/// ```
/// # use queue_rpc::{create_memory_transport, MemoryHub, Transport};
/// let hub = MemoryHub::new();
/// hub.add_broker("127.0.0.1:4150");
/// hub.register_lookup("127.0.0.1:4161", vec!["127.0.0.1:4150".into()]);
///
/// let transport = create_memory_transport("node-a", hub.clone());
/// assert_eq!(transport.transport_id(), "node-a");
/// ```
#[derive(Default)]
pub struct MemoryHub {
    // ---
    brokers: Mutex<HashMap<String, Arc<Broker>>>,
    lookups: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a broker at `address`. Adding an existing address is a no-op.
    pub fn add_broker(&self, address: impl Into<String>) {
        let address = address.into();
        lock_ignore_poison(&self.brokers)
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Broker::new(address)));
    }

    /// Start a lookup service at `address` that reports `brokers`.
    pub fn register_lookup(&self, address: impl Into<String>, brokers: Vec<String>) {
        lock_ignore_poison(&self.lookups).insert(address.into(), brokers);
    }

    /// Take a broker offline or bring it back. While offline, publishes and
    /// new connections to it fail. Consumers already attached keep draining.
    pub fn set_broker_online(&self, address: &str, online: bool) {
        if let Some(broker) = lock_ignore_poison(&self.brokers).get(address) {
            broker.online.store(online, Ordering::Release);
        }
    }

    /// Counters for `topic`/`channel` on the broker at `address`.
    pub fn channel_stats(
        &self,
        address: &str,
        topic: impl Into<Topic>,
        channel: impl Into<Channel>,
    ) -> Option<ChannelStats> {
        let broker = self.find_broker(address)?;
        broker.stats(&topic.into(), &channel.into())
    }

    fn find_broker(&self, address: &str) -> Option<Arc<Broker>> {
        lock_ignore_poison(&self.brokers).get(address).cloned()
    }

    fn online_broker(&self, address: &str) -> Result<Arc<Broker>> {
        match self.find_broker(address) {
            Some(broker) if broker.is_online() => Ok(broker),
            Some(_) => Err(RpcError::Connect(format!("broker {address} is unavailable"))),
            None => Err(RpcError::Connect(format!("no broker at {address}"))),
        }
    }

    /// Brokers reachable through `endpoint`.
    fn brokers_for(&self, endpoint: &Endpoint) -> Result<Vec<Arc<Broker>>> {
        // ---
        match endpoint {
            Endpoint::Broker(addr) => Ok(vec![self.online_broker(addr)?]),
            Endpoint::Lookup(addr) => {
                let listed = lock_ignore_poison(&self.lookups)
                    .get(addr)
                    .cloned()
                    .ok_or_else(|| RpcError::Connect(format!("no lookup service at {addr}")))?;
                listed.iter().map(|b| self.online_broker(b)).collect()
            }
        }
    }
}

/// Settles one in-flight message back at its channel.
struct MemorySettle {
    queue: Arc<ChannelQueue>,
    id: String,
}

impl Settle for MemorySettle {
    fn ack(self: Box<Self>) {
        self.queue.ack(&self.id);
    }

    fn requeue(self: Box<Self>, delay: Duration) {
        if delay.is_zero() {
            self.queue.requeue(&self.id);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.queue.requeue(&self.id);
        });
    }
}

struct MemoryProducer {
    transport_id: String,
    broker: Arc<Broker>,
    stopped: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn address(&self) -> &str {
        &self.broker.address
    }

    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        // ---
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "{}: producer for {} is stopped",
                self.transport_id, self.broker.address
            )));
        }
        log_debug!(
            "{}: publish {} bytes to {topic} at {}",
            self.transport_id,
            body.len(),
            self.broker.address
        );
        self.broker.publish(topic, body)
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            log_debug!(
                "{}: producer for {} stopped",
                self.transport_id,
                self.broker.address
            );
        }
    }
}

/// Moves messages from one channel queue into one consumer.
struct Pump {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct MemoryConsumer {
    transport_id: String,
    hub: Arc<MemoryHub>,
    topic: Topic,
    channel: Channel,
    tx: mpsc::Sender<Delivery>,
    rx: AsyncMutex<mpsc::Receiver<Delivery>>,
    connections: Mutex<HashMap<Endpoint, Vec<Pump>>>,
    stopped: CancellationToken,
}

impl MemoryConsumer {
    fn spawn_pump(&self, queue: Arc<ChannelQueue>) -> Pump {
        // ---
        let token = self.stopped.child_token();
        let tx = self.tx.clone();
        let handle = tokio::spawn(pump(queue, tx, token.clone()));
        Pump { token, handle }
    }
}

/// Reserve consumer capacity first, then take a message, so a busy consumer
/// leaves messages ready for its channel siblings.
async fn pump(queue: Arc<ChannelQueue>, tx: mpsc::Sender<Delivery>, token: CancellationToken) {
    // ---
    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let msg = loop {
            if let Some(msg) = queue.take() {
                break msg;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = queue.available.notified() => {}
            }
        };

        let settle = MemorySettle {
            queue: queue.clone(),
            id: msg.id.clone(),
        };
        permit.send(Delivery::new(msg.id, msg.body, msg.attempts, Box::new(settle)));
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        // ---
        if self.stopped.is_cancelled() {
            return Err(RpcError::Connect(format!(
                "{}: consumer is stopped",
                self.transport_id
            )));
        }
        if lock_ignore_poison(&self.connections).contains_key(endpoint) {
            return Ok(());
        }

        let brokers = self.hub.brokers_for(endpoint)?;
        let pumps: Vec<Pump> = brokers
            .iter()
            .map(|broker| self.spawn_pump(broker.channel(&self.topic, &self.channel)))
            .collect();

        log_info!(
            "{}: consumer {}/{} connected to {endpoint} ({} broker(s))",
            self.transport_id,
            self.topic,
            self.channel,
            pumps.len()
        );

        let mut connections = lock_ignore_poison(&self.connections);
        if connections.contains_key(endpoint) {
            // lost a race with a concurrent connect to the same endpoint
            for pump in pumps {
                pump.token.cancel();
            }
        } else {
            connections.insert(endpoint.clone(), pumps);
        }
        Ok(())
    }

    async fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        // ---
        let removed = lock_ignore_poison(&self.connections).remove(endpoint);
        if let Some(pumps) = removed {
            for pump in &pumps {
                pump.token.cancel();
            }
            for pump in pumps {
                let _ = pump.handle.await;
            }
            log_info!(
                "{}: consumer {}/{} disconnected from {endpoint}",
                self.transport_id,
                self.topic,
                self.channel
            );
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Delivery> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => None,
            delivery = rx.recv() => delivery,
        }
    }

    async fn stop(&self) {
        // ---
        if self.stopped.is_cancelled() {
            return;
        }
        self.stopped.cancel();

        let pumps: Vec<Pump> = lock_ignore_poison(&self.connections)
            .drain()
            .flat_map(|(_, pumps)| pumps)
            .collect();
        for pump in pumps {
            let _ = pump.handle.await;
        }

        // fetched but never handed out
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut _returned = 0usize;
        while let Ok(delivery) = rx.try_recv() {
            delivery.requeue(Duration::ZERO);
            _returned += 1;
        }

        log_info!(
            "{}: consumer {}/{} stopped, requeued {_returned} buffered message(s)",
            self.transport_id,
            self.topic,
            self.channel
        );
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.stopped.is_cancelled() {
            log_warn!(
                "{}: consumer {}/{} dropped without stop",
                self.transport_id,
                self.topic,
                self.channel
            );
            self.stopped.cancel();
        }
    }
}

/// In-memory transport.
///
/// Opens producers and consumers against the brokers of a shared
/// [`MemoryHub`].
struct MemoryTransport {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn producer(&self, broker_address: &str) -> Result<ProducerPtr> {
        // ---
        let broker = self.hub.online_broker(broker_address)?;
        log_debug!("{}: producer opened for {broker_address}", self.transport_id);
        Ok(Arc::new(MemoryProducer {
            transport_id: self.transport_id.clone(),
            broker,
            stopped: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        topic: Topic,
        channel: Channel,
        max_in_flight: usize,
    ) -> Result<ConsumerPtr> {
        // ---
        let (tx, rx) = mpsc::channel(max_in_flight.max(1));
        Ok(Arc::new(MemoryConsumer {
            transport_id: self.transport_id.clone(),
            hub: self.hub.clone(),
            topic,
            channel,
            tx,
            rx: AsyncMutex::new(rx),
            connections: Mutex::new(HashMap::new()),
            stopped: CancellationToken::new(),
        }))
    }
}

/// Create an in-memory transport on `hub`.
pub fn create_memory_transport(
    transport_id: impl Into<String>,
    hub: Arc<MemoryHub>,
) -> TransportPtr {
    // ---
    let transport_id = transport_id.into();
    log_debug!("{transport_id}: create memory transport");
    Arc::new(MemoryTransport { transport_id, hub })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const BROKER: &str = "mem:4150";

    fn setup() -> (Arc<MemoryHub>, TransportPtr) {
        let hub = MemoryHub::new();
        hub.add_broker(BROKER);
        let transport = create_memory_transport("test", hub.clone());
        (hub, transport)
    }

    fn broker() -> Endpoint {
        Endpoint::Broker(BROKER.into())
    }

    #[tokio::test]
    async fn test_backlog_goes_to_first_channel() {
        // ---
        let (hub, transport) = setup();
        let producer = transport.producer(BROKER).await.unwrap();
        producer.publish(&"t".into(), Bytes::from_static(b"early")).await.unwrap();

        let consumer = transport.consumer("t".into(), "c".into(), 4).await.unwrap();
        consumer.connect(&broker()).await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.body().as_ref(), b"early");
        assert_eq!(delivery.attempts(), 1);
        delivery.ack();

        let stats = hub.channel_stats(BROKER, "t", "c").unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.in_flight, 0);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_attempts() {
        // ---
        let (_hub, transport) = setup();
        let consumer = transport.consumer("t".into(), "c".into(), 1).await.unwrap();
        consumer.connect(&broker()).await.unwrap();

        let producer = transport.producer(BROKER).await.unwrap();
        producer.publish(&"t".into(), Bytes::from_static(b"x")).await.unwrap();

        let first = consumer.recv().await.unwrap();
        let id = first.id().to_string();
        first.requeue(Duration::ZERO);

        let second = consumer.recv().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.attempts(), 2);
        second.ack();
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_broker_is_connect_error() {
        // ---
        let (_hub, transport) = setup();
        assert!(matches!(
            transport.producer("nowhere:1").await,
            Err(RpcError::Connect(_))
        ));

        let consumer = transport.consumer("t".into(), "c".into(), 1).await.unwrap();
        assert!(matches!(
            consumer.connect(&Endpoint::Lookup("nowhere:2".into())).await,
            Err(RpcError::Connect(_))
        ));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_offline_broker_rejects_publish() {
        // ---
        let (hub, transport) = setup();
        let producer = transport.producer(BROKER).await.unwrap();
        hub.set_broker_online(BROKER, false);

        let err = producer.publish(&"t".into(), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));

        hub.set_broker_online(BROKER, true);
        producer.publish(&"t".into(), Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_producer_rejects_publish() {
        // ---
        let (_hub, transport) = setup();
        let producer = transport.producer(BROKER).await.unwrap();
        producer.stop().await;
        producer.stop().await;
        assert!(producer.publish(&"t".into(), Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_recv() {
        // ---
        let (_hub, transport) = setup();
        let consumer = transport.consumer("t".into(), "c".into(), 1).await.unwrap();
        consumer.connect(&broker()).await.unwrap();
        consumer.stop().await;
        consumer.stop().await;
        assert!(consumer.recv().await.is_none());
    }
}
