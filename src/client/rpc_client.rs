// src/client/rpc_client.rs
//! RPC client implementation.
//!
//! The client consumes its own reply topic and runs a background receive
//! loop that matches incoming replies to pending calls by correlation id.
//!
//! Each call generates a unique correlation id and registers a oneshot
//! channel in the pending table before the request is published, so a fast
//! reply can never arrive before its entry exists. Replies are always
//! acknowledged: a reply nobody is waiting for is logged and discarded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::pending::PendingCalls;
use crate::lifecycle::Phase;
use crate::protocol::{decode, encode};
use crate::transport::{BoundConsumer, BoundProducer, TransportBinding};
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    CorrelationId,
    Envelope,
    LifecyclePhase,
    Result,
    RpcConfig,
    RpcError,
    Topic,
};

/// How often calls whose caller stopped polling are swept out.
const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```
/// use queue_rpc::{
///     create_memory_transport, HandlerRegistry, MemoryHub, RpcClient, RpcConfig,
///     ServerRuntime, StaticEndpoints, TransportBinding, DEFAULT_BROKER_ADDRESS,
/// };
/// use bytes::Bytes;
/// use std::sync::Arc;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// hub.add_broker(DEFAULT_BROKER_ADDRESS);
/// let endpoints = Arc::new(StaticEndpoints::local());
///
/// let registry = HandlerRegistry::builder()
///     .register("Echo", |_ctx, body| async move { Ok(body) })
///     .build();
/// let server = ServerRuntime::start(
///     TransportBinding::new(create_memory_transport("server", hub.clone()), endpoints.clone()),
///     registry,
///     RpcConfig::new("server"),
/// )
/// .await?;
///
/// let client = RpcClient::start(
///     TransportBinding::new(create_memory_transport("client", hub), endpoints),
///     RpcConfig::new("client"),
/// )
/// .await?;
///
/// let reply = client.request("Echo", Bytes::from_static(b"hi")).await?;
/// assert_eq!(reply, Bytes::from_static(b"hi"));
///
/// client.shutdown().await;
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    node_id: String,
    config: RpcConfig,
    request_topic: Topic,
    reply_topic: Topic,
    producer: Arc<BoundProducer>,
    consumer: Arc<BoundConsumer>,
    pending: Arc<PendingCalls>,
    cancel: CancellationToken,
    phase: Phase,
    tasks: Mutex<Option<JoinSet<()>>>,
}

/// Removes the pending entry when a call ends early or its future is
/// dropped. A no-op once the entry has been completed.
struct PendingGuard {
    pending: Arc<PendingCalls>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

impl RpcClient {
    // ---
    /// Start a client: resolve endpoints, open the request producer, open
    /// the reply consumer, start the receive loop.
    ///
    /// # Errors
    ///
    /// - `RpcError::MissingConfig` / `ConfigConflict` for an invalid config
    /// - `RpcError::Discovery` if endpoints cannot be resolved
    /// - `RpcError::Connect` if the producer or consumer cannot connect
    pub async fn start(binding: TransportBinding, config: RpcConfig) -> Result<Self> {
        // ---
        config.validate()?;
        let phase = Phase::new();

        let set = binding.resolve().await?;
        let producer = Arc::new(binding.open_producer(&set).await?);

        let consumer = match binding
            .open_consumer(
                &set,
                config.reply_topic(),
                config.reply_channel(),
                config.concurrency,
            )
            .await
        {
            Ok(consumer) => Arc::new(consumer),
            Err(err) => {
                producer.stop().await;
                return Err(err);
            }
        };

        let pending = Arc::new(PendingCalls::new());
        let cancel = CancellationToken::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(receive_loop(
            config.node_id.clone(),
            consumer.clone(),
            pending.clone(),
        ));
        tasks.spawn(expire_loop(pending.clone(), cancel.clone()));

        log_info!(
            "{}: client started, replies on {}/{}",
            config.node_id,
            config.reply_topic,
            config.reply_channel
        );
        phase.set_running();

        Ok(Self {
            inner: Arc::new(Inner {
                node_id: config.node_id.clone(),
                request_topic: config.request_topic(),
                reply_topic: config.reply_topic(),
                config,
                producer,
                consumer,
                pending,
                cancel,
                phase,
                tasks: Mutex::new(Some(tasks)),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phase.get()
    }

    /// Number of calls awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// True while a call with this correlation id awaits a reply.
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.inner.pending.contains(correlation_id)
    }

    /// Call `method` with a raw payload, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - `RpcError::UnknownMethod` / `Handler` for application failures
    ///   reported by the server, or immediately for an empty method name
    /// - `RpcError::Timeout` if no reply arrives in time
    /// - `RpcError::Cancelled` if the client shuts down first
    /// - `RpcError::Transport` / `Encode` if the request cannot be published
    pub async fn call(&self, method: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        // no server can route it, and it would never be answered
        if method.is_empty() {
            return Err(RpcError::UnknownMethod(String::new()));
        }

        let correlation_id = CorrelationId::generate();
        let deadline = deadline_after(timeout);
        let mut rx = inner.pending.register(correlation_id.clone(), deadline);
        let _guard = PendingGuard {
            pending: inner.pending.clone(),
            correlation_id: correlation_id.clone(),
        };

        // shutdown may have drained the table between the check and register
        if inner.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let request = Envelope::request(
            method,
            payload,
            correlation_id.clone(),
            inner.reply_topic.clone(),
        );
        let body = encode(&request)?;
        inner.producer.publish(&inner.request_topic, body).await?;
        log_debug!("{}: sent {method} ({correlation_id})", inner.node_id);

        match time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            // the sender is only dropped after a send
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_elapsed) => {
                if inner.pending.remove(&correlation_id) {
                    log_debug!("{}: {method} ({correlation_id}) timed out", inner.node_id);
                    Err(RpcError::Timeout)
                } else {
                    // completed between the deadline and the removal
                    rx.try_recv().unwrap_or(Err(RpcError::Timeout))
                }
            }
        }
    }

    /// Call `method` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::call`].
    pub async fn request(&self, method: &str, payload: Bytes) -> Result<Bytes> {
        self.call(method, payload, self.inner.config.request_timeout)
            .await
    }

    /// Call `method` with a JSON-encoded request, decoding the JSON reply.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::call`], plus `RpcError::Serialization` if the
    /// request cannot be encoded or the reply cannot be decoded as `TResp`.
    pub async fn call_typed<TReq, TResp>(
        &self,
        method: &str,
        req: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = Bytes::from(serde_json::to_vec(req)?);
        let reply = self.call(method, payload, timeout).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// [`RpcClient::call_typed`] with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::call_typed`].
    pub async fn request_typed<TReq, TResp>(&self, method: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        self.call_typed(method, req, self.inner.config.request_timeout)
            .await
    }

    /// Shut the client down: stop the reply consumer, fail every pending
    /// call with `RpcError::Cancelled`, then stop the producer. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        // ---
        let inner = &self.inner;
        if !inner.phase.begin_shutdown() {
            inner.phase.stopped().await;
            return;
        }

        inner.consumer.stop().await;

        inner.cancel.cancel();
        let _cancelled = inner.pending.cancel_all();
        log_info!("{}: cancelled {_cancelled} pending call(s)", inner.node_id);

        let tasks = lock_ignore_poison(&inner.tasks).take();
        if let Some(mut tasks) = tasks {
            while let Some(joined) = tasks.join_next().await {
                if let Err(_err) = joined {
                    log_error!("{}: client task ended abnormally: {_err}", inner.node_id);
                }
            }
        }

        inner.producer.stop().await;
        inner.phase.set_stopped();
        log_info!("{}: client stopped", inner.node_id);
    }
}

/// `now + timeout`, saturating at a far-future deadline so that
/// `Duration::MAX` means "wait indefinitely".
fn deadline_after(timeout: Duration) -> Instant {
    // ---
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Route replies to pending calls until the reply consumer is stopped.
async fn receive_loop(node_id: String, consumer: Arc<BoundConsumer>, pending: Arc<PendingCalls>) {
    // ---
    while let Some(delivery) = consumer.recv().await {
        match decode(delivery.body().clone()) {
            Ok(envelope) if envelope.is_request() => {
                log_warn!(
                    "{node_id}: discarding request ({}) received on reply topic",
                    envelope.correlation_id
                );
            }
            Ok(envelope) => {
                let correlation_id = envelope.correlation_id.clone();
                if !pending.complete(correlation_id.as_str(), envelope.into_result()) {
                    log_debug!("{node_id}: discarding late reply ({correlation_id})");
                }
            }
            Err(_err) => {
                log_warn!("{node_id}: discarding malformed reply: {_err}");
            }
        }
        delivery.ack();
    }
    log_debug!("{node_id}: receive loop exiting");
}

/// Resolve calls whose deadline passed without the caller noticing.
async fn expire_loop(pending: Arc<PendingCalls>, cancel: CancellationToken) {
    // ---
    let mut tick = time::interval(EXPIRE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                pending.expire(Instant::now());
            }
        }
    }
}
