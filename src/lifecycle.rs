// src/lifecycle.rs

//! Lifecycle controller.
//!
//! Startup order is fixed: resolve endpoints, open the producer, open the
//! consumer, then start work. Shutdown runs the reverse in three strict
//! steps:
//!
//! 1. stop the consumer, so no new message is accepted
//! 2. cancel the shared context and wait for in-flight work to settle;
//!    interrupted messages go back to the broker unacknowledged
//! 3. stop the producer
//!
//! Stopping the producer before in-flight work settles would fail replies
//! that could still have been sent; cancelling before the consumer stops
//! would let new messages start against a cancelled context.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::server::{spawn_workers, DispatchStats, Dispatcher};
use crate::transport::{BoundConsumer, BoundProducer, TransportBinding};
use crate::{
    // ---
    lock_ignore_poison,
    log_error,
    log_info,
    DispatchCounts,
    HandlerRegistry,
    Result,
    RpcConfig,
    RpcError,
};

/// Where a server or client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Resolving endpoints and opening connections.
    Starting,
    /// Accepting work.
    Running,
    /// Shutdown in progress: no new work, in-flight work settling.
    Draining,
    /// Fully stopped. Terminal.
    Stopped,
}

/// Shared phase cell. Guarantees the shutdown sequence runs once.
pub(crate) struct Phase {
    tx: watch::Sender<LifecyclePhase>,
}

impl Phase {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecyclePhase::Starting);
        Self { tx }
    }

    pub(crate) fn get(&self) -> LifecyclePhase {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecyclePhase> {
        self.tx.subscribe()
    }

    pub(crate) fn set_running(&self) {
        self.tx.send_replace(LifecyclePhase::Running);
    }

    /// Move to `Draining`. Returns false if shutdown already began, in
    /// which case the caller must not run the sequence again.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.tx.send_if_modified(|phase| match phase {
            LifecyclePhase::Starting | LifecyclePhase::Running => {
                *phase = LifecyclePhase::Draining;
                true
            }
            LifecyclePhase::Draining | LifecyclePhase::Stopped => false,
        })
    }

    pub(crate) fn set_stopped(&self) {
        self.tx.send_replace(LifecyclePhase::Stopped);
    }

    /// Wait until the phase is `Stopped`.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this only ends at Stopped
        let _ = rx.wait_for(|phase| *phase == LifecyclePhase::Stopped).await;
    }
}

/// Wait for SIGINT or SIGTERM (ctrl-c on non-unix platforms).
///
/// # Errors
///
/// `RpcError::Signal` if the signal handlers cannot be installed.
pub async fn shutdown_signal() -> Result<()> {
    // ---
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt()).map_err(RpcError::Signal)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(RpcError::Signal)?;
        tokio::select! {
            _ = interrupt.recv() => log_info!("received SIGINT"),
            _ = terminate.recv() => log_info!("received SIGTERM"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(RpcError::Signal)?;
        log_info!("received ctrl-c");
        Ok(())
    }
}

/// A running RPC server.
///
/// Cheap to clone; all clones control the same server.
///
/// # Example
///
/// ```
/// use queue_rpc::{
///     create_memory_transport, HandlerRegistry, MemoryHub, RpcConfig, ServerRuntime,
///     StaticEndpoints, TransportBinding, DEFAULT_BROKER_ADDRESS,
/// };
/// use std::sync::Arc;
///
/// # async fn example() -> queue_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// hub.add_broker(DEFAULT_BROKER_ADDRESS);
///
/// let binding = TransportBinding::new(
///     create_memory_transport("server", hub),
///     Arc::new(StaticEndpoints::local()),
/// );
/// let registry = HandlerRegistry::builder()
///     .register("Echo", |_ctx, body| async move { Ok(body) })
///     .build();
///
/// let server = ServerRuntime::start(binding, registry, RpcConfig::new("server")).await?;
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServerRuntime {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    node_id: String,
    phase: Phase,
    producer: Arc<BoundProducer>,
    consumer: Arc<BoundConsumer>,
    cancel: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
    stats: Arc<DispatchStats>,
}

impl ServerRuntime {
    /// Start serving: resolve endpoints, open the reply producer, open the
    /// request consumer, start `config.concurrency` workers.
    ///
    /// # Errors
    ///
    /// - `RpcError::MissingConfig` / `ConfigConflict` for an invalid config
    /// - `RpcError::Discovery` if endpoints cannot be resolved
    /// - `RpcError::Connect` if the producer or consumer cannot connect;
    ///   anything opened so far is stopped first
    pub async fn start(
        binding: TransportBinding,
        registry: HandlerRegistry,
        config: RpcConfig,
    ) -> Result<Self> {
        // ---
        config.validate()?;
        let phase = Phase::new();

        let set = binding.resolve().await?;
        log_info!(
            "{}: starting server, broker {} lookups {:?}",
            config.node_id,
            set.broker_address(),
            set.lookup_addresses()
        );

        let producer = Arc::new(binding.open_producer(&set).await?);

        let consumer = match binding
            .open_consumer(
                &set,
                config.request_topic(),
                config.server_channel(),
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

        let cancel = CancellationToken::new();
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Arc::new(Dispatcher {
            node_id: config.node_id.clone(),
            registry: Arc::new(registry),
            producer: producer.clone(),
            cancel: cancel.clone(),
            requeue_delay: config.requeue_delay,
            drain_timeout: config.drain_timeout,
        });
        let workers = spawn_workers(config.concurrency, consumer.clone(), dispatcher, stats.clone());

        phase.set_running();
        Ok(Self {
            inner: Arc::new(ServerInner {
                node_id: config.node_id,
                phase,
                producer,
                consumer,
                cancel,
                workers: Mutex::new(Some(workers)),
                stats,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.inner.phase.get()
    }

    /// Observe phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.inner.phase.subscribe()
    }

    /// Dispatch outcome totals so far.
    pub fn stats(&self) -> DispatchCounts {
        self.inner.stats.snapshot()
    }

    /// Run the shutdown sequence. Safe to call more than once and from
    /// several tasks; later callers wait for the first to finish.
    pub async fn shutdown(&self) {
        // ---
        let inner = &self.inner;
        if !inner.phase.begin_shutdown() {
            inner.phase.stopped().await;
            return;
        }

        log_info!("{}: shutdown: stopping consumer", inner.node_id);
        inner.consumer.stop().await;

        log_info!("{}: shutdown: cancelling in-flight work", inner.node_id);
        inner.cancel.cancel();
        let workers = lock_ignore_poison(&inner.workers).take();
        if let Some(mut workers) = workers {
            while let Some(joined) = workers.join_next().await {
                if let Err(_err) = joined {
                    log_error!("{}: worker ended abnormally: {_err}", inner.node_id);
                }
            }
        }

        log_info!("{}: shutdown: stopping producer", inner.node_id);
        inner.producer.stop().await;

        inner.phase.set_stopped();
        log_info!("{}: server stopped ({:?})", inner.node_id, self.stats());
    }

    /// Wait until the server is fully stopped.
    pub async fn stopped(&self) {
        self.inner.phase.stopped().await
    }

    /// Serve until SIGINT/SIGTERM, then shut down.
    ///
    /// # Errors
    ///
    /// `RpcError::Signal` if signal handlers cannot be installed. The server
    /// is shut down in that case too.
    pub async fn run_until_signal(&self) -> Result<()> {
        let waited = shutdown_signal().await;
        self.shutdown().await;
        waited
    }
}
