//! `Add` RPC server backed by Redis Streams.
//!
//! Serves until SIGINT/SIGTERM, then drains in-flight requests and exits.
//!
//! Run with: cargo run --example add_server --features transport_redis
//!
//! Requires: Redis on `RPC_BROKER_ADDRESS` (default 127.0.0.1:4150), e.g.
//! `docker run -p 4150:6379 redis`
mod common;

use std::sync::Arc;

use common::{AddRequest, AddResponse, ADD_METHOD};
use queue_rpc::{RpcConfig, RpcServerBuilder, StaticEndpoints, TransportBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    common::init_tracing();

    let transport = TransportBuilder::new()
        .transport_id("add-server")
        .transport_type("redis")
        .build()?;

    let server = RpcServerBuilder::new(transport)
        .endpoints(Arc::new(StaticEndpoints::from_env()?))
        .config(RpcConfig::from_env("add-server")?)
        .register_typed(ADD_METHOD, |_ctx, req: AddRequest| async move {
            Ok(AddResponse { z: req.x + req.y })
        })
        .start()
        .await?;

    server.run_until_signal().await?;
    println!("served: {:?}", server.stats());

    Ok(())
}
