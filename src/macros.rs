// src/macros.rs

//
// Logging macros
//
// logging feature enabled  → tracing, under the `queue_rpc` target
// logging feature disabled → log_error and log_warn print to stderr,
//                            the rest compile to nothing
//
// Values referenced only from a disabled macro are unused in that build, so
// call sites name such bindings with a leading underscore.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => { tracing::error!(target: "queue_rpc", $($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => { eprintln!("[queue_rpc ERROR] {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!(target: "queue_rpc", $($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { eprintln!("[queue_rpc WARN] {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => { tracing::info!(target: "queue_rpc", $($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!(target: "queue_rpc", $($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
