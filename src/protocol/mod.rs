//! RPC envelope and its wire codec.
//!
//! The codec is independent of the application payload's own encoding:
//! payloads are carried as opaque bytes.

mod codec;
mod envelope;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use envelope::{Envelope, Fault, FaultKind};
