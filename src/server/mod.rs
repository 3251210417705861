//! RPC server: handler registry, per-message dispatch and the worker pool.
//!
//! A fixed number of workers pull deliveries from the request consumer and
//! dispatch them one at a time each, so at most `concurrency` requests are
//! in progress at once regardless of how bursty the broker is.

mod dispatch;
mod handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::transport::BoundConsumer;
use crate::{log_debug, log_info};

pub use dispatch::DispatchOutcome;
pub(crate) use dispatch::Dispatcher;
pub use handler::{CallContext, HandlerError, HandlerRegistry, HandlerRegistryBuilder};

/// Running totals of dispatch outcomes.
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    replied_ok: AtomicU64,
    replied_error: AtomicU64,
    permanent_failure: AtomicU64,
    cancelled: AtomicU64,
    reply_failed: AtomicU64,
}

impl DispatchStats {
    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::RepliedOk => &self.replied_ok,
            DispatchOutcome::RepliedError => &self.replied_error,
            DispatchOutcome::PermanentFailure => &self.permanent_failure,
            DispatchOutcome::Cancelled => &self.cancelled,
            DispatchOutcome::ReplyFailed => &self.reply_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            replied_ok: self.replied_ok.load(Ordering::Relaxed),
            replied_error: self.replied_error.load(Ordering::Relaxed),
            permanent_failure: self.permanent_failure.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            reply_failed: self.reply_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of how many inbound messages ended in each [`DispatchOutcome`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    pub replied_ok: u64,
    pub replied_error: u64,
    pub permanent_failure: u64,
    pub cancelled: u64,
    pub reply_failed: u64,
}

impl DispatchCounts {
    pub fn total(&self) -> u64 {
        self.replied_ok
            + self.replied_error
            + self.permanent_failure
            + self.cancelled
            + self.reply_failed
    }
}

/// Spawn `concurrency` workers. Each exits once the consumer is stopped and
/// its current dispatch, if any, has settled.
pub(crate) fn spawn_workers(
    concurrency: usize,
    consumer: Arc<BoundConsumer>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<DispatchStats>,
) -> JoinSet<()> {
    // ---
    let mut workers = JoinSet::new();
    for _index in 0..concurrency.max(1) {
        let consumer = consumer.clone();
        let dispatcher = dispatcher.clone();
        let stats = stats.clone();
        workers.spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                let outcome = dispatcher.dispatch(delivery).await;
                stats.record(outcome);
            }
            log_debug!("{}: worker {_index} exiting", dispatcher.node_id);
        });
    }
    log_info!(
        "{}: started {} worker(s) on {}/{}",
        dispatcher.node_id,
        concurrency.max(1),
        consumer.topic(),
        consumer.channel()
    );
    workers
}
