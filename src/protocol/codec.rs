// src/protocol/codec.rs

//! Binary envelope codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic        u32   "QRPC"
//! version      u8
//! flags        u8    bit0 method, bit1 reply_to, bit2 fault
//! created_at   u64   ms since epoch
//! corr_id      u16 len + utf8
//! method       u16 len + utf8          (flag bit0)
//! reply_to     u16 len + utf8          (flag bit1)
//! fault        u8 kind, u32 len + utf8 (flag bit2)
//! payload      u32 len + bytes
//! ```
//!
//! Decoding never panics: every read is length-checked first and leftover
//! input is rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::envelope::{Envelope, Fault, FaultKind};
use crate::{CorrelationId, Topic};

pub const MAGIC: u32 = 0x5152_5043;
pub const VERSION: u8 = 1;

const FLAG_METHOD: u8 = 0b001;
const FLAG_REPLY_TO: u8 = 0b010;
const FLAG_FAULT: u8 = 0b100;
const KNOWN_FLAGS: u8 = FLAG_METHOD | FLAG_REPLY_TO | FLAG_FAULT;

// magic + version + flags + created_at
const HEADER_LEN: usize = 4 + 1 + 1 + 8;

/// Failure to decode an envelope. Permanent: retrying the same bytes fails again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incomplete envelope: needed {needed} more bytes")]
    Incomplete { needed: usize },
    #[error("invalid magic number {0:#010x}")]
    InvalidMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("unknown fault kind {0}")]
    UnknownFaultKind(u8),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("missing or empty field {0}")]
    MissingField(&'static str),
}

/// Failure to encode an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("field {0} exceeds its wire length limit")]
    FieldTooLarge(&'static str),
}

/// Encode an envelope into a standalone byte buffer.
pub fn encode(env: &Envelope) -> Result<Bytes, EncodeError> {
    // ---
    let mut flags = 0u8;
    if env.method.is_some() {
        flags |= FLAG_METHOD;
    }
    if env.reply_to.is_some() {
        flags |= FLAG_REPLY_TO;
    }
    if env.fault.is_some() {
        flags |= FLAG_FAULT;
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64 + env.payload.len());
    buf.put_u32(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(flags);
    buf.put_u64(env.created_at_ms);

    put_str16(&mut buf, "correlation_id", env.correlation_id.as_str())?;
    if let Some(method) = &env.method {
        put_str16(&mut buf, "method", method)?;
    }
    if let Some(reply_to) = &env.reply_to {
        put_str16(&mut buf, "reply_to", &reply_to.0)?;
    }
    if let Some(fault) = &env.fault {
        buf.put_u8(fault.kind as u8);
        put_len32(&mut buf, "fault", fault.message.len())?;
        buf.put_slice(fault.message.as_bytes());
    }

    put_len32(&mut buf, "payload", env.payload.len())?;
    buf.put_slice(&env.payload);

    Ok(buf.freeze())
}

/// Decode an envelope. The payload is sliced out of `input` without copying.
pub fn decode(mut input: Bytes) -> Result<Envelope, DecodeError> {
    // ---
    need(&input, HEADER_LEN)?;

    let magic = input.get_u32();
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }
    let version = input.get_u8();
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let flags = input.get_u8();
    if flags & !KNOWN_FLAGS != 0 {
        return Err(DecodeError::UnknownFlags(flags));
    }
    let created_at_ms = input.get_u64();

    let correlation_id = take_str16(&mut input, "correlation_id")?;
    if correlation_id.is_empty() {
        return Err(DecodeError::MissingField("correlation_id"));
    }

    let method = if flags & FLAG_METHOD != 0 {
        let method = take_str16(&mut input, "method")?;
        if method.is_empty() {
            return Err(DecodeError::MissingField("method"));
        }
        Some(method.into())
    } else {
        None
    };

    let reply_to = if flags & FLAG_REPLY_TO != 0 {
        let topic = take_str16(&mut input, "reply_to")?;
        if topic.is_empty() {
            return Err(DecodeError::MissingField("reply_to"));
        }
        Some(Topic::from(topic))
    } else {
        None
    };

    let fault = if flags & FLAG_FAULT != 0 {
        need(&input, 1)?;
        let tag = input.get_u8();
        let kind = FaultKind::from_wire(tag).ok_or(DecodeError::UnknownFaultKind(tag))?;
        let message = take_str32(&mut input, "fault")?;
        Some(Fault { kind, message })
    } else {
        None
    };

    need(&input, 4)?;
    let len = input.get_u32() as usize;
    need(&input, len)?;
    let payload = input.split_to(len);

    if input.has_remaining() {
        return Err(DecodeError::TrailingBytes(input.remaining()));
    }

    Ok(Envelope {
        correlation_id: CorrelationId::from(correlation_id),
        method,
        reply_to,
        payload,
        fault,
        created_at_ms,
    })
}

fn need(input: &Bytes, len: usize) -> Result<(), DecodeError> {
    if input.remaining() < len {
        return Err(DecodeError::Incomplete {
            needed: len - input.remaining(),
        });
    }
    Ok(())
}

fn put_str16(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), EncodeError> {
    let len = u16::try_from(value.len()).map_err(|_| EncodeError::FieldTooLarge(field))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_len32(buf: &mut BytesMut, field: &'static str, len: usize) -> Result<(), EncodeError> {
    let len = u32::try_from(len).map_err(|_| EncodeError::FieldTooLarge(field))?;
    buf.put_u32(len);
    Ok(())
}

fn take_str16(input: &mut Bytes, field: &'static str) -> Result<String, DecodeError> {
    need(input, 2)?;
    let len = input.get_u16() as usize;
    take_utf8(input, field, len)
}

fn take_str32(input: &mut Bytes, field: &'static str) -> Result<String, DecodeError> {
    need(input, 4)?;
    let len = input.get_u32() as usize;
    take_utf8(input, field, len)
}

fn take_utf8(input: &mut Bytes, field: &'static str, len: usize) -> Result<String, DecodeError> {
    need(input, len)?;
    let raw = input.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}
