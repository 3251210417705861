// src/transport/redis/streams.rs

//! Redis Streams transport implementation using `redis`.
//!
//! Topic/channel semantics map onto Redis Streams directly:
//!
//! - a topic is a stream, a publish is `XADD`
//! - a channel is a consumer group on that stream (`XGROUP CREATE ... MKSTREAM`)
//! - consumers in the same group share its entries via `XREADGROUP`
//! - groups start at `0`, so entries published before the first consumer
//!   of a channel connected are still delivered to it
//! - acknowledge is `XACK`
//! - requeue leaves the entry pending in its group and marks it idle with
//!   `XCLAIM ... IDLE`; readers of the same group pick such entries up again
//!   with `XPENDING` + `XCLAIM`, so other groups on the stream never see it
//! - publishes cap the stream with `MAXLEN ~`
//!
//! ## Concurrency model
//!
//! Each connected endpoint gets a **reader task** that owns a dedicated
//! connection, because a blocking `XREADGROUP` stalls every other command
//! multiplexed on the same connection. Acks and requeues go through a
//! separate shared multiplexed connection.
//!
//! ## Deviations from the in-memory reference
//!
//! - Lookup endpoints are not supported; consumers attach to brokers only.
//! - An entry read by a reader that is cancelled mid-read, or held by a
//!   consumer that died, is redelivered once it has been idle for
//!   [`STALE_IDLE_MS`].
//! - Needs Redis 7 or newer: `XPENDING ... IDLE`, and `XCLAIM` silently
//!   dropping entries that were trimmed while pending.
//! - A stream longer than [`STREAM_MAXLEN`] loses its oldest entries even if
//!   a group has not read them yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    //
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
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

const BODY_FIELD: &str = "body";
const BLOCK_MS: u64 = 1000;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const RECLAIM_INTERVAL: Duration = Duration::from_secs(1);

/// Pending entries idle this long are taken over by any reader of the group.
const STALE_IDLE_MS: u64 = 5 * 60 * 1000;

/// Approximate upper bound on entries kept per stream.
const STREAM_MAXLEN: u64 = 100_000;

fn redis_url(address: &str) -> String {
    if address.starts_with("redis://") || address.starts_with("rediss://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    }
}

async fn connect(address: &str) -> Result<MultiplexedConnection> {
    // ---
    let url = redis_url(address);
    let client = redis::Client::open(url.as_str()).map_err(|err| {
        let msg = format!("redis: failed to open client for {url}: {err}");
        log_error!("{msg}");
        RpcError::Connect(msg)
    })?;

    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| {
            let msg = format!("redis: failed to connect to {url}: {err}");
            log_error!("{msg}");
            RpcError::Connect(msg)
        })
}

fn xadd_cmd(topic: &str, body: &[u8]) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(topic)
        .arg("MAXLEN")
        .arg("~")
        .arg(STREAM_MAXLEN)
        .arg("*")
        .arg(BODY_FIELD)
        .arg(body);
    cmd
}

fn group_create_cmd(topic: &str, group: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("CREATE").arg(topic).arg(group).arg("0").arg("MKSTREAM");
    cmd
}

fn xack_cmd(topic: &str, group: &str, id: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XACK");
    cmd.arg(topic).arg(group).arg(id);
    cmd
}

/// Keeps `id` pending for `group` but makes it look stale, so the next
/// reclaim by any reader of the group redelivers it.
fn release_cmd(topic: &str, group: &str, consumer: &str, id: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XCLAIM");
    cmd.arg(topic)
        .arg(group)
        .arg(consumer)
        .arg(0)
        .arg(id)
        .arg("IDLE")
        .arg(STALE_IDLE_MS)
        .arg("JUSTID");
    cmd
}

/// Oldest entry of `group` that has been idle for at least [`STALE_IDLE_MS`].
fn stale_pending_cmd(topic: &str, group: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(topic)
        .arg(group)
        .arg("IDLE")
        .arg(STALE_IDLE_MS)
        .arg("-")
        .arg("+")
        .arg(1);
    cmd
}

fn claim_cmd(topic: &str, group: &str, consumer: &str, id: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("XCLAIM");
    cmd.arg(topic)
        .arg(group)
        .arg(consumer)
        .arg(STALE_IDLE_MS)
        .arg(id);
    cmd
}

/// Settles one stream entry.
struct RedisSettle {
    conn: MultiplexedConnection,
    topic: Topic,
    group: Channel,
    consumer_name: String,
    id: String,
}

impl Settle for RedisSettle {
    fn ack(self: Box<Self>) {
        let mut this = *self;
        tokio::spawn(async move {
            let acked = xack_cmd(&this.topic.0, &this.group.0, &this.id)
                .query_async::<i64>(&mut this.conn)
                .await;
            if let Err(_err) = acked {
                log_error!("redis: XACK {} on {} failed: {_err}", this.id, this.topic);
            }
        });
    }

    fn requeue(self: Box<Self>, delay: Duration) {
        let mut this = *self;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // a failure leaves the entry pending; it goes stale on its own
            let released = release_cmd(&this.topic.0, &this.group.0, &this.consumer_name, &this.id)
                .query_async::<redis::Value>(&mut this.conn)
                .await;
            if let Err(_err) = released {
                log_error!("redis: requeue of {} on {} failed: {_err}", this.id, this.topic);
            }
        });
    }
}

struct RedisProducer {
    address: String,
    conn: MultiplexedConnection,
    stopped: AtomicBool,
}

#[async_trait]
impl Producer for RedisProducer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        // ---
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "redis: producer for {} is stopped",
                self.address
            )));
        }

        let mut conn = self.conn.clone();
        xadd_cmd(&topic.0, &body)
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| {
                let msg = format!("redis: XADD to {topic} at {} failed: {err}", self.address);
                log_error!("{msg}");
                RpcError::Transport(msg)
            })
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

struct Reader {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct RedisConsumer {
    transport_id: String,
    consumer_name: String,
    topic: Topic,
    channel: Channel,
    tx: mpsc::Sender<Delivery>,
    rx: AsyncMutex<mpsc::Receiver<Delivery>>,
    readers: Mutex<HashMap<Endpoint, Reader>>,
    stopped: CancellationToken,
}

struct ReaderCtx {
    transport_id: String,
    consumer_name: String,
    topic: Topic,
    group: Channel,
    read_conn: MultiplexedConnection,
    settle_conn: MultiplexedConnection,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
}

impl ReaderCtx {
    async fn run(mut self) {
        // ---
        let mut next_reclaim = Instant::now();
        loop {
            let permit = tokio::select! {
                _ = self.token.cancelled() => return,
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            // entries released by requeue or left behind by dead readers
            if Instant::now() >= next_reclaim {
                let reclaimed = tokio::select! {
                    _ = self.token.cancelled() => return,
                    reclaimed = reclaim(
                        &mut self.read_conn,
                        &self.topic,
                        &self.group,
                        &self.consumer_name,
                        &self.transport_id,
                    ) => reclaimed,
                };
                match reclaimed {
                    Some((entry, attempts)) => {
                        permit.send(self.delivery(entry, attempts));
                        continue;
                    }
                    None => next_reclaim = Instant::now() + RECLAIM_INTERVAL,
                }
            }

            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&*self.group.0)
                .arg(&self.consumer_name)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(BLOCK_MS)
                .arg("STREAMS")
                .arg(&*self.topic.0)
                .arg(">");
            let read = cmd.query_async::<Option<StreamReadReply>>(&mut self.read_conn);

            let reply = tokio::select! {
                _ = self.token.cancelled() => return,
                reply = read => reply,
            };

            let entry = match reply {
                Ok(Some(reply)) => reply.keys.into_iter().flat_map(|key| key.ids).next(),
                Ok(None) => None,
                Err(_err) => {
                    log_error!(
                        "{}: XREADGROUP on {} failed: {_err}",
                        self.transport_id,
                        self.topic
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                    None
                }
            };
            let Some(entry) = entry else {
                continue;
            };
            permit.send(self.delivery(entry, 1));
        }
    }

    fn delivery(&self, entry: StreamId, attempts: u32) -> Delivery {
        // ---
        let body: Vec<u8> = entry.get(BODY_FIELD).unwrap_or_default();
        let settle = RedisSettle {
            conn: self.settle_conn.clone(),
            topic: self.topic.clone(),
            group: self.group.clone(),
            consumer_name: self.consumer_name.clone(),
            id: entry.id.clone(),
        };
        Delivery::new(entry.id, Bytes::from(body), attempts, Box::new(settle))
    }
}

/// Take over the oldest stale pending entry of `group`, if any. Returns it
/// with its delivery count.
async fn reclaim(
    conn: &mut MultiplexedConnection,
    topic: &Topic,
    group: &Channel,
    consumer_name: &str,
    _transport_id: &str,
) -> Option<(StreamId, u32)> {
    // ---
    let pending = stale_pending_cmd(&topic.0, &group.0)
        .query_async::<Vec<(String, String, u64, u32)>>(conn)
        .await;
    let (id, _owner, _idle, deliveries) = match pending {
        Ok(pending) => pending.into_iter().next()?,
        Err(_err) => {
            log_error!("{_transport_id}: XPENDING on {topic} failed: {_err}");
            return None;
        }
    };

    // another reader may win the claim, or the entry was trimmed
    let claimed = claim_cmd(&topic.0, &group.0, consumer_name, &id)
        .query_async::<StreamClaimReply>(conn)
        .await;
    match claimed {
        Ok(reply) => {
            let entry = reply.ids.into_iter().next()?;
            log_debug!("{_transport_id}: reclaimed {} on {topic}/{group}", entry.id);
            Some((entry, deliveries + 1))
        }
        Err(_err) => {
            log_error!("{_transport_id}: XCLAIM {id} on {topic} failed: {_err}");
            None
        }
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        // ---
        let address = match endpoint {
            Endpoint::Broker(addr) => addr.as_str(),
            Endpoint::Lookup(addr) => {
                return Err(RpcError::Connect(format!(
                    "redis: lookup endpoints are not supported ({addr})"
                )));
            }
        };
        if self.stopped.is_cancelled() {
            return Err(RpcError::Connect(format!(
                "{}: consumer is stopped",
                self.transport_id
            )));
        }
        if lock_ignore_poison(&self.readers).contains_key(endpoint) {
            return Ok(());
        }

        let mut read_conn = connect(address).await?;
        let settle_conn = connect(address).await?;

        let created = group_create_cmd(&self.topic.0, &self.channel.0)
            .query_async::<()>(&mut read_conn)
            .await;
        if let Err(err) = created {
            // an existing group is fine
            if err.code() != Some("BUSYGROUP") {
                return Err(RpcError::Connect(format!(
                    "redis: XGROUP CREATE {}/{} failed: {err}",
                    self.topic, self.channel
                )));
            }
        }

        let token = self.stopped.child_token();
        let ctx = ReaderCtx {
            transport_id: self.transport_id.clone(),
            consumer_name: self.consumer_name.clone(),
            topic: self.topic.clone(),
            group: self.channel.clone(),
            read_conn,
            settle_conn,
            tx: self.tx.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(ctx.run());

        log_info!(
            "{}: consumer {}/{} connected to {endpoint}",
            self.transport_id,
            self.topic,
            self.channel
        );
        lock_ignore_poison(&self.readers).insert(endpoint.clone(), Reader { token, handle });
        Ok(())
    }

    async fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let removed = lock_ignore_poison(&self.readers).remove(endpoint);
        if let Some(reader) = removed {
            reader.token.cancel();
            let _ = reader.handle.await;
            log_info!("{}: disconnected from {endpoint}", self.transport_id);
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

        let readers: Vec<Reader> = lock_ignore_poison(&self.readers)
            .drain()
            .map(|(_, reader)| reader)
            .collect();
        for reader in readers {
            let _ = reader.handle.await;
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        while let Ok(delivery) = rx.try_recv() {
            delivery.requeue(Duration::ZERO);
        }
        log_debug!("{}: consumer {}/{} stopped", self.transport_id, self.topic, self.channel);
    }
}

/// Redis Streams implementation of the `Transport` trait.
struct RedisTransport {
    transport_id: String,
}

#[async_trait]
impl Transport for RedisTransport {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn producer(&self, broker_address: &str) -> Result<ProducerPtr> {
        // ---
        let conn = connect(broker_address).await?;
        log_info!("{}: producer connected to {broker_address}", self.transport_id);
        Ok(Arc::new(RedisProducer {
            address: broker_address.to_string(),
            conn,
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
        Ok(Arc::new(RedisConsumer {
            consumer_name: format!("{}-{}", self.transport_id, uuid::Uuid::new_v4()),
            transport_id: self.transport_id.clone(),
            topic,
            channel,
            tx,
            rx: AsyncMutex::new(rx),
            readers: Mutex::new(HashMap::new()),
            stopped: CancellationToken::new(),
        }))
    }
}

/// Creates a Redis Streams transport. Connections are opened lazily, per
/// producer and per consumer endpoint.
pub fn create_transport(transport_id: impl Into<String>) -> Result<TransportPtr> {
    Ok(Arc::new(RedisTransport {
        transport_id: transport_id.into(),
    }))
}
