//! `Add` RPC client backed by Redis Streams.
//!
//! Run with: cargo run --example add_client --features transport_redis -- 2 3
//!
//! Requires: the `add_server` example running against the same Redis.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{AddRequest, AddResponse, ADD_METHOD};
use queue_rpc::{RpcClientBuilder, StaticEndpoints, TransportBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    common::init_tracing();

    let mut args = std::env::args().skip(1);
    let x: i64 = args.next().unwrap_or_else(|| "2".into()).parse()?;
    let y: i64 = args.next().unwrap_or_else(|| "3".into()).parse()?;

    let node_id = format!("add-client-{}", std::process::id());
    let transport = TransportBuilder::new()
        .transport_id(node_id.clone())
        .transport_type("redis")
        .build()?;

    let client = RpcClientBuilder::new(transport)
        .endpoints(Arc::new(StaticEndpoints::from_env()?))
        .node_id(node_id)
        .request_timeout(Duration::from_secs(5))
        .start()
        .await?;

    let resp: AddResponse = client
        .request_typed(ADD_METHOD, &AddRequest { x, y })
        .await?;
    println!("{x} + {y} = {}", resp.z);

    client.shutdown().await;
    Ok(())
}
