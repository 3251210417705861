// src/protocol/envelope.rs

//! RPC envelope carried across the transport.
//!
//! The envelope wraps the application payload with what the RPC layer needs
//! to route and correlate it. The payload itself is opaque bytes; its
//! encoding is the application's business.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::{CorrelationId, RpcError, Topic};

/// Classification of an application-level failure delivered in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaultKind {
    /// No handler was registered for the requested method.
    UnknownMethod = 1,
    /// The handler returned an error.
    Handler = 2,
    /// The handler panicked; the dispatcher contained it.
    Panicked = 3,
}

impl FaultKind {
    pub(crate) fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FaultKind::UnknownMethod),
            2 => Some(FaultKind::Handler),
            3 => Some(FaultKind::Panicked),
            _ => None,
        }
    }
}

/// Application error carried by a reply envelope in place of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn unknown_method(method: &str) -> Self {
        Self {
            kind: FaultKind::UnknownMethod,
            message: method.to_string(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Handler,
            message: message.into(),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Panicked,
            message: message.into(),
        }
    }

    /// Convert into the error returned to the calling code.
    pub fn into_error(self) -> RpcError {
        match self.kind {
            FaultKind::UnknownMethod => RpcError::UnknownMethod(self.message),
            FaultKind::Handler => RpcError::Handler(self.message),
            FaultKind::Panicked => RpcError::Handler(format!("handler panicked: {}", self.message)),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FaultKind::UnknownMethod => write!(f, "unknown method: {}", self.message),
            FaultKind::Handler => write!(f, "handler error: {}", self.message),
            FaultKind::Panicked => write!(f, "handler panicked: {}", self.message),
        }
    }
}

/// An RPC envelope.
///
/// Requests carry a non-empty `method` and a `reply_to` topic. Replies carry
/// neither; they are routed by the transport to the request's `reply_to` and
/// matched by `correlation_id` alone. A reply holds either a payload or a
/// [`Fault`].
///
/// # Examples
///
/// ```
/// # use queue_rpc::{CorrelationId, Envelope, Topic};
/// # use bytes::Bytes;
/// let id = CorrelationId::generate();
/// let request = Envelope::request(
///     "Add",
///     Bytes::from_static(br#"{"X":2,"Y":3}"#),
///     id.clone(),
///     Topic::from("reply.client-1"),
/// );
/// assert!(request.is_request());
///
/// let reply = Envelope::reply(id, Bytes::from_static(br#"{"Z":5}"#));
/// assert!(!reply.is_request());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Correlation identifier linking a request to its reply.
    pub correlation_id: CorrelationId,

    /// Method name for handler dispatch. `Some` for requests, `None` for replies.
    pub method: Option<Arc<str>>,

    /// Topic the reply must be published to. Requests only.
    pub reply_to: Option<Topic>,

    /// Opaque application payload.
    pub payload: Bytes,

    /// Application error, replies only. When set the payload is empty.
    pub fault: Option<Fault>,

    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

impl Envelope {
    // ---
    /// Create a request envelope stamped with the current time.
    pub fn request(
        method: impl Into<Arc<str>>,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: Topic,
    ) -> Self {
        Self {
            correlation_id,
            method: Some(method.into()),
            reply_to: Some(reply_to),
            payload,
            fault: None,
            created_at_ms: now_ms(),
        }
    }

    /// Create a successful reply envelope.
    pub fn reply(correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            correlation_id,
            method: None,
            reply_to: None,
            payload,
            fault: None,
            created_at_ms: now_ms(),
        }
    }

    /// Create a reply envelope carrying an application error.
    pub fn fault(correlation_id: CorrelationId, fault: Fault) -> Self {
        Self {
            correlation_id,
            method: None,
            reply_to: None,
            payload: Bytes::new(),
            fault: Some(fault),
            created_at_ms: now_ms(),
        }
    }

    /// True when this envelope asks for a method invocation.
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Resolve a reply into the payload or the application error it carries.
    pub fn into_result(self) -> crate::Result<Bytes> {
        match self.fault {
            Some(fault) => Err(fault.into_error()),
            None => Ok(self.payload),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_fault_reply_resolves_to_error() {
        // ---
        let env = Envelope::fault(CorrelationId::generate(), Fault::unknown_method("Sub"));
        let err = env.into_result().unwrap_err();
        assert!(matches!(err, RpcError::UnknownMethod(ref m) if m == "Sub"));
    }

    #[test]
    fn test_panicked_fault_is_handler_error() {
        // ---
        let err = Fault::panicked("index out of bounds").into_error();
        assert!(matches!(err, RpcError::Handler(ref m) if m.contains("panicked")));
    }

    #[test]
    fn test_request_shape() {
        // ---
        let env = Envelope::request(
            "Add",
            Bytes::new(),
            CorrelationId::generate(),
            Topic::from("reply.x"),
        );
        assert!(env.is_request());
        assert_eq!(env.reply_to, Some(Topic::from("reply.x")));
        assert!(env.created_at_ms > 0);
    }
}
