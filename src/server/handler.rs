// src/server/handler.rs

//! Handler contract and registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{log_warn, CorrelationId, RpcError};

/// Application error returned by a handler.
///
/// Crosses the wire as data: the caller receives it as
/// `RpcError::Handler(message)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {err}"))
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        Self::new(err.to_string())
    }
}

/// Per-invocation context handed to a handler.
///
/// The cancellation token fires when the server shuts down while the call is
/// in progress. Handlers doing long work should watch it; their message is
/// requeued either way.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: Arc<str>,
    correlation_id: CorrelationId,
    attempts: u32,
    cancel: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        method: Arc<str>,
        correlation_id: CorrelationId,
        attempts: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method,
            correlation_id,
            attempts,
            cancel,
        }
    }

    /// Method name the request was addressed to.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// How many times the transport has delivered this request, starting at 1.
    /// Greater than 1 means an earlier attempt was requeued.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the server starts shutting down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Type-erased handler stored in the registry.
pub(crate) trait HandlerFn: Send + Sync {
    fn call(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>>;
}

// Byte-level handler closure
struct RawHandler<F> {
    func: F,
}

impl<F, Fut> HandlerFn for RawHandler<F>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        Box::pin((self.func)(ctx, payload))
    }
}

// serde_json typed handler closure
struct TypedHandler<F, Fut, TReq, TResp>
where
    F: Fn(CallContext, TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp, HandlerError>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> HandlerFn for TypedHandler<F, Fut, TReq, TResp>
where
    F: Fn(CallContext, TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp, HandlerError>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        // Deserialize request
        let req: TReq = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        // Call handler
        let fut = (self.func)(ctx, req);

        Box::pin(async move {
            let resp = fut.await?;
            let bytes = serde_json::to_vec(&resp)?;
            Ok(Bytes::from(bytes))
        })
    }
}

/// Method name to handler mapping. Immutable once built.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn HandlerFn>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<dyn HandlerFn>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers before the server starts.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn HandlerFn>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler working on raw payload bytes.
    ///
    /// Registering the same method twice keeps the later handler.
    pub fn register<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.insert(method.into(), Arc::new(RawHandler { func: handler }));
        self
    }

    /// Register a handler whose payloads are JSON-encoded `TReq`/`TResp`.
    ///
    /// A request payload that does not deserialize is answered with a
    /// handler error; the handler is not called.
    ///
    /// # Example
    ///
    /// ```
    /// use queue_rpc::{HandlerError, HandlerRegistry};
    /// use serde::{Deserialize, Serialize};
    ///
    /// #[derive(Deserialize)]
    /// struct AddRequest { x: i64, y: i64 }
    ///
    /// #[derive(Serialize)]
    /// struct AddResponse { z: i64 }
    ///
    /// let registry = HandlerRegistry::builder()
    ///     .register_typed("Add", |_ctx, req: AddRequest| async move {
    ///         Ok::<_, HandlerError>(AddResponse { z: req.x + req.y })
    ///     })
    ///     .build();
    /// assert!(registry.contains("Add"));
    /// ```
    pub fn register_typed<F, Fut, TReq, TResp>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp, HandlerError>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        let handler = TypedHandler {
            func: handler,
            _phantom: PhantomData,
        };
        self.insert(method.into(), Arc::new(handler));
        self
    }

    fn insert(&mut self, method: String, handler: Arc<dyn HandlerFn>) {
        if self.handlers.insert(method.clone(), handler).is_some() {
            log_warn!("handler for {method} registered twice, keeping the later one");
        }
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;

    fn ctx(method: &str) -> CallContext {
        CallContext::new(method.into(), CorrelationId::generate(), 1, CancellationToken::new())
    }

    #[derive(Deserialize)]
    struct Pair {
        x: i64,
        y: i64,
    }

    #[derive(Serialize)]
    struct Sum {
        z: i64,
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        // ---
        let registry = HandlerRegistry::builder()
            .register_typed("Add", |_ctx, p: Pair| async move { Ok(Sum { z: p.x + p.y }) })
            .build();

        let handler = registry.get("Add").unwrap();
        let out = handler
            .call(ctx("Add"), Bytes::from_static(br#"{"x":2,"y":3}"#))
            .await
            .unwrap();
        assert_eq!(out.as_ref(), br#"{"z":5}"#);
    }

    #[tokio::test]
    async fn test_typed_handler_bad_payload_is_handler_error() {
        // ---
        let registry = HandlerRegistry::builder()
            .register_typed("Add", |_ctx, p: Pair| async move { Ok(Sum { z: p.x + p.y }) })
            .build();

        let err = registry
            .get("Add")
            .unwrap()
            .call(ctx("Add"), Bytes::from_static(b"not json"))
            .await
            .unwrap_err();
        assert!(err.message().starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn test_raw_handler_sees_context() {
        // ---
        let registry = HandlerRegistry::builder()
            .register("Echo", |ctx: CallContext, body: Bytes| async move {
                assert_eq!(ctx.method(), "Echo");
                Ok(body)
            })
            .build();

        let out = registry
            .get("Echo")
            .unwrap()
            .call(ctx("Echo"), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"abc");
    }

    #[test]
    fn test_registry_lookup() {
        // ---
        let registry = HandlerRegistry::builder()
            .register("B", |_ctx, b: Bytes| async move { Ok(b) })
            .register("A", |_ctx, b: Bytes| async move { Ok(b) })
            .build();

        assert_eq!(registry.methods(), vec!["A", "B"]);
        assert!(registry.get("Sub").is_none());
        assert_eq!(registry.len(), 2);
    }
}
