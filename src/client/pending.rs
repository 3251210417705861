// src/client/pending.rs

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{lock_ignore_poison, CorrelationId, Result, RpcError};

/// One outstanding call.
struct PendingCall {
    tx: oneshot::Sender<Result<Bytes>>,
    deadline: Instant,
    _created_at: Instant,
}

/// Correlation id to pending call table.
///
/// An entry is created when a request is published and removed exactly once:
/// by the matching reply, by the caller giving up (timeout or drop), or by
/// shutdown. Whoever removes it decides the call's result.
pub(super) struct PendingCalls {
    // ---
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
}

impl PendingCalls {
    pub(super) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Register a call. The receiver resolves when the entry is completed.
    pub(super) fn register(
        &self,
        correlation_id: CorrelationId,
        deadline: Instant,
    ) -> oneshot::Receiver<Result<Bytes>> {
        // ---
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            tx,
            deadline,
            _created_at: Instant::now(),
        };
        lock_ignore_poison(&self.calls).insert(correlation_id, call);
        rx
    }

    /// Resolve a call with a reply. Returns false when no such call is
    /// pending, i.e. the reply is late or a duplicate.
    pub(super) fn complete(&self, correlation_id: &str, result: Result<Bytes>) -> bool {
        // ---
        let call = lock_ignore_poison(&self.calls).remove(correlation_id);
        match call {
            Some(call) => {
                // the caller may have just been dropped
                let _ = call.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove a call without resolving it. Returns false if it was already
    /// removed.
    pub(super) fn remove(&self, correlation_id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.calls).remove(correlation_id).is_some()
    }

    /// Resolve every pending call with `RpcError::Cancelled`.
    pub(super) fn cancel_all(&self) -> usize {
        // ---
        let drained: Vec<PendingCall> = lock_ignore_poison(&self.calls)
            .drain()
            .map(|(_, call)| call)
            .collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(RpcError::Cancelled));
        }
        count
    }

    /// Remove every call whose deadline is before `now`, resolving it with
    /// `RpcError::Timeout`. Covers callers that stopped polling.
    pub(super) fn expire(&self, now: Instant) -> usize {
        // ---
        let expired: Vec<PendingCall> = {
            let mut calls = lock_ignore_poison(&self.calls);
            let ids: Vec<CorrelationId> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };
        let count = expired.len();
        for call in expired {
            let _ = call.tx.send(Err(RpcError::Timeout));
        }
        count
    }

    pub(super) fn len(&self) -> usize {
        lock_ignore_poison(&self.calls).len()
    }

    pub(super) fn contains(&self, correlation_id: &str) -> bool {
        lock_ignore_poison(&self.calls).contains_key(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        // ---
        let pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let rx = pending.register(id.clone(), later());
        assert_eq!(pending.len(), 1);
        assert!(pending.contains(id.as_str()));

        assert!(pending.complete(id.as_str(), Ok(Bytes::from("test response"))));
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from("test response"));
    }

    #[test]
    fn test_late_reply_is_rejected() {
        // ---
        let pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let _rx = pending.register(id.clone(), later());
        assert!(pending.remove(&id));
        assert!(!pending.complete(id.as_str(), Ok(Bytes::new())));
        assert!(!pending.remove(&id));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        // ---
        let pending = PendingCalls::new();
        let a = pending.register(CorrelationId::generate(), later());
        let b = pending.register(CorrelationId::generate(), later());

        assert_eq!(pending.cancel_all(), 2);
        assert_eq!(pending.len(), 0);
        assert!(matches!(a.await.unwrap(), Err(RpcError::Cancelled)));
        assert!(matches!(b.await.unwrap(), Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_expire_only_past_deadlines() {
        // ---
        let pending = PendingCalls::new();
        let now = Instant::now();
        let old = pending.register(CorrelationId::generate(), now);
        let _fresh = pending.register(CorrelationId::generate(), later());

        assert_eq!(pending.expire(now + Duration::from_millis(1)), 1);
        assert_eq!(pending.len(), 1);
        assert!(matches!(old.await.unwrap(), Err(RpcError::Timeout)));
    }
}
