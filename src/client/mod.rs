//! RPC client: publishes requests and correlates replies.

mod pending;
mod rpc_client;

pub use rpc_client::RpcClient;
