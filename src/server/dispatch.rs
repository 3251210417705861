// src/server/dispatch.rs

//! Per-message dispatch.
//!
//! Every inbound delivery goes through the same steps:
//!
//! ```text
//! Received -> Decoding -> Dispatching -> RepliedOk | RepliedError | PermanentFailure
//! ```
//!
//! plus two exits that return the message to the broker instead of
//! acknowledging it: `Cancelled` (shutdown interrupted the handler) and
//! `ReplyFailed` (the reply could not be published).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::handler::{CallContext, HandlerRegistry};
use crate::protocol::{decode, encode};
use crate::transport::BoundProducer;
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    CorrelationId,
    Delivery,
    Envelope,
    Fault,
    Topic,
};

/// How a single inbound message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; reply published; message acknowledged.
    RepliedOk,
    /// Unknown method, handler error or handler panic; error reply
    /// published; message acknowledged.
    RepliedError,
    /// Not a decodable request; acknowledged without a reply.
    PermanentFailure,
    /// Shutdown interrupted the handler; message requeued.
    Cancelled,
    /// The reply could not be published; message requeued.
    ReplyFailed,
}

impl DispatchOutcome {
    /// True when the inbound message was acknowledged.
    pub fn acknowledged(self) -> bool {
        matches!(
            self,
            DispatchOutcome::RepliedOk
                | DispatchOutcome::RepliedError
                | DispatchOutcome::PermanentFailure
        )
    }
}

pub(crate) struct Dispatcher {
    pub(crate) node_id: String,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) producer: Arc<BoundProducer>,
    pub(crate) cancel: CancellationToken,
    pub(crate) requeue_delay: Duration,
    pub(crate) drain_timeout: Duration,
}

impl Dispatcher {
    pub(crate) async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        // --- Decoding
        let envelope = match decode(delivery.body().clone()) {
            Ok(envelope) => envelope,
            Err(_err) => {
                log_warn!(
                    "{}: discarding malformed message {}: {_err}",
                    self.node_id,
                    delivery.id()
                );
                delivery.ack();
                return DispatchOutcome::PermanentFailure;
            }
        };

        let (method, reply_to) = match (envelope.method.clone(), envelope.reply_to.clone()) {
            (Some(method), Some(reply_to)) => (method, reply_to),
            _ => {
                log_warn!(
                    "{}: discarding message {} that is not a request (correlation {})",
                    self.node_id,
                    delivery.id(),
                    envelope.correlation_id
                );
                delivery.ack();
                return DispatchOutcome::PermanentFailure;
            }
        };
        let correlation_id = envelope.correlation_id;

        // --- Dispatching
        let Some(handler) = self.registry.get(&method) else {
            log_warn!(
                "{}: unknown method {method} (correlation {correlation_id})",
                self.node_id
            );
            let reply = Envelope::fault(correlation_id, Fault::unknown_method(&method));
            return self
                .reply(delivery, &reply_to, reply, DispatchOutcome::RepliedError)
                .await;
        };

        let ctx = CallContext::new(
            method.clone(),
            correlation_id.clone(),
            delivery.attempts(),
            self.cancel.child_token(),
        );
        let payload = envelope.payload;

        // The handler is created inside the guarded future so a panic while
        // building it is contained too. Once shutdown is seen the message is
        // requeued, whatever the handler ends up returning.
        let call = AssertUnwindSafe(async move { handler.call(ctx, payload).await }).catch_unwind();
        tokio::pin!(call);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // Give a cooperative handler the chance to unwind; its result
                // is discarded because the message goes back either way.
                let _ = tokio::time::timeout(self.drain_timeout, &mut call).await;
                log_debug!(
                    "{}: {method} (correlation {correlation_id}) cancelled, requeueing",
                    self.node_id
                );
                delivery.requeue(Duration::ZERO);
                return DispatchOutcome::Cancelled;
            }
            result = &mut call => result,
        };

        let (reply, outcome) = match result {
            Ok(Ok(body)) => (
                Envelope::reply(correlation_id.clone(), body),
                DispatchOutcome::RepliedOk,
            ),
            Ok(Err(err)) => {
                log_debug!(
                    "{}: {method} (correlation {correlation_id}) failed: {err}",
                    self.node_id
                );
                (
                    Envelope::fault(correlation_id.clone(), Fault::handler(err.message())),
                    DispatchOutcome::RepliedError,
                )
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                log_error!(
                    "{}: handler for {method} panicked (correlation {correlation_id}): {message}",
                    self.node_id
                );
                (
                    Envelope::fault(correlation_id.clone(), Fault::panicked(message)),
                    DispatchOutcome::RepliedError,
                )
            }
        };

        self.reply(delivery, &reply_to, reply, outcome).await
    }

    /// Publish `reply`, then settle the inbound message: ack on success,
    /// requeue on publish failure so the request is retried rather than lost.
    async fn reply(
        &self,
        delivery: Delivery,
        reply_to: &Topic,
        reply: Envelope,
        outcome: DispatchOutcome,
    ) -> DispatchOutcome {
        // ---
        let correlation_id = reply.correlation_id.clone();
        let (body, outcome) = match encode(&reply) {
            Ok(body) => (body, outcome),
            Err(err) => match encode_fallback(correlation_id.clone(), &err.to_string()) {
                Some(body) => (body, DispatchOutcome::RepliedError),
                None => {
                    log_error!(
                        "{}: reply for {correlation_id} cannot be encoded: {err}",
                        self.node_id
                    );
                    delivery.ack();
                    return DispatchOutcome::PermanentFailure;
                }
            },
        };

        match self.producer.publish(reply_to, body).await {
            Ok(()) => {
                delivery.ack();
                outcome
            }
            Err(_err) => {
                log_error!(
                    "{}: reply for {correlation_id} to {reply_to} failed, requeueing request: {_err}",
                    self.node_id
                );
                delivery.requeue(self.requeue_delay);
                DispatchOutcome::ReplyFailed
            }
        }
    }
}

fn encode_fallback(correlation_id: CorrelationId, reason: &str) -> Option<bytes::Bytes> {
    let fault = Fault::handler(format!("reply could not be encoded: {reason}"));
    encode(&Envelope::fault(correlation_id, fault)).ok()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        create_memory_transport, Consumer, Endpoint, FaultKind, HandlerError, MemoryHub,
        RpcError, StaticEndpoints, Transport, TransportBinding,
    };
    use bytes::Bytes;

    const BROKER: &str = "mem:1";

    struct Rig {
        hub: Arc<MemoryHub>,
        dispatcher: Dispatcher,
        requests: Arc<dyn Consumer>,
        replies: Arc<dyn Consumer>,
        publisher: Arc<dyn crate::Producer>,
    }

    async fn rig(registry: HandlerRegistry) -> Rig {
        // ---
        let hub = MemoryHub::new();
        hub.add_broker(BROKER);
        let transport = create_memory_transport("dispatch-test", hub.clone());
        let binding = TransportBinding::new(
            transport.clone(),
            Arc::new(StaticEndpoints::new(crate::EndpointSet::new(BROKER))),
        );
        let set = binding.resolve().await.unwrap();
        let producer = Arc::new(binding.open_producer(&set).await.unwrap());

        let requests = transport.consumer("request".into(), "server".into(), 8).await.unwrap();
        requests.connect(&Endpoint::Broker(BROKER.into())).await.unwrap();
        let replies = transport.consumer("reply".into(), "client".into(), 8).await.unwrap();
        replies.connect(&Endpoint::Broker(BROKER.into())).await.unwrap();
        let publisher = transport.producer(BROKER).await.unwrap();

        Rig {
            hub,
            dispatcher: Dispatcher {
                node_id: "server".into(),
                registry: Arc::new(registry),
                producer,
                cancel: CancellationToken::new(),
                requeue_delay: Duration::ZERO,
                drain_timeout: Duration::from_secs(1),
            },
            requests,
            replies,
            publisher,
        }
    }

    impl Rig {
        async fn send(&self, body: Bytes) -> Delivery {
            self.publisher.publish(&"request".into(), body).await.unwrap();
            self.requests.recv().await.unwrap()
        }

        async fn send_request(&self, method: &str, payload: &'static [u8]) -> (CorrelationId, Delivery) {
            let id = CorrelationId::generate();
            let env = Envelope::request(method, Bytes::from_static(payload), id.clone(), "reply".into());
            (id, self.send(encode(&env).unwrap()).await)
        }

        async fn reply(&self) -> Envelope {
            let delivery = self.replies.recv().await.unwrap();
            let env = decode(delivery.body().clone()).unwrap();
            delivery.ack();
            env
        }

        fn stats(&self) -> crate::ChannelStats {
            self.hub.channel_stats(BROKER, "request", "server").unwrap()
        }
    }

    fn echo_registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .register("Echo", |_ctx, body: Bytes| async move { Ok(body) })
            .register("Fail", |_ctx, _body: Bytes| async move {
                Err(HandlerError::new("bad input"))
            })
            .register("Panic", |_ctx, _body: Bytes| async move {
                if true {
                    panic!("boom");
                }
                Ok(Bytes::new())
            })
            .build()
    }

    #[tokio::test]
    async fn test_success_replies_and_acks() {
        // ---
        let rig = rig(echo_registry()).await;
        let (id, delivery) = rig.send_request("Echo", b"ping").await;

        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::RepliedOk);

        let reply = rig.reply().await;
        assert_eq!(reply.correlation_id, id);
        assert_eq!(reply.into_result().unwrap().as_ref(), b"ping");
        assert_eq!(rig.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_unknown_method_replies_with_fault() {
        // ---
        let rig = rig(echo_registry()).await;
        let (id, delivery) = rig.send_request("Sub", b"{}").await;

        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::RepliedError);

        let reply = rig.reply().await;
        assert_eq!(reply.correlation_id, id);
        assert_eq!(reply.fault.as_ref().map(|f| f.kind), Some(FaultKind::UnknownMethod));
        assert!(matches!(reply.into_result(), Err(RpcError::UnknownMethod(m)) if m == "Sub"));
        assert_eq!(rig.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_delivered() {
        // ---
        let rig = rig(echo_registry()).await;

        let (_, delivery) = rig.send_request("Fail", b"").await;
        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::RepliedError);
        assert!(matches!(rig.reply().await.into_result(), Err(RpcError::Handler(m)) if m == "bad input"));

        let (_, delivery) = rig.send_request("Panic", b"").await;
        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::RepliedError);
        let reply = rig.reply().await;
        assert_eq!(reply.fault.as_ref().map(|f| f.kind), Some(FaultKind::Panicked));

        assert_eq!(rig.stats().acked, 2);
    }

    #[tokio::test]
    async fn test_garbage_is_acked_without_reply() {
        // ---
        let rig = rig(echo_registry()).await;
        let delivery = rig.send(Bytes::from_static(b"\x00\x01garbage")).await;

        assert_eq!(
            rig.dispatcher.dispatch(delivery).await,
            DispatchOutcome::PermanentFailure
        );
        assert_eq!(rig.stats().acked, 1);

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), rig.replies.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_reply_envelope_on_request_topic_is_discarded() {
        // ---
        let rig = rig(echo_registry()).await;
        let stray = Envelope::reply(CorrelationId::generate(), Bytes::from_static(b"x"));
        let delivery = rig.send(encode(&stray).unwrap()).await;

        assert_eq!(
            rig.dispatcher.dispatch(delivery).await,
            DispatchOutcome::PermanentFailure
        );
    }

    #[tokio::test]
    async fn test_reply_publish_failure_requeues() {
        // ---
        let rig = rig(echo_registry()).await;
        let (_, delivery) = rig.send_request("Echo", b"ping").await;

        rig.hub.set_broker_online(BROKER, false);
        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::ReplyFailed);
        rig.hub.set_broker_online(BROKER, true);

        let stats = rig.stats();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.requeued, 1);

        // the same request comes back for another attempt
        let again = rig.requests.recv().await.unwrap();
        assert_eq!(again.attempts(), 2);
        assert_eq!(rig.dispatcher.dispatch(again).await, DispatchOutcome::RepliedOk);
    }

    #[tokio::test]
    async fn test_cancel_requeues_in_flight_message() {
        // ---
        let registry = HandlerRegistry::builder()
            .register("Block", |ctx: CallContext, _body: Bytes| async move {
                ctx.cancelled().await;
                Err(HandlerError::new("cancelled"))
            })
            .build();
        let rig = rig(registry).await;
        let (_, delivery) = rig.send_request("Block", b"").await;

        let cancel = rig.dispatcher.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert_eq!(rig.dispatcher.dispatch(delivery).await, DispatchOutcome::Cancelled);
        let stats = rig.stats();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.requeued, 1);
    }

    #[test]
    fn test_panic_message() {
        // ---
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
