//! `Add` server and client in one process over the in-memory broker.
//!
//! Run with: cargo run --example add_memory
mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{AddRequest, AddResponse, ADD_METHOD};
use queue_rpc::{
    MemoryHub, RpcClientBuilder, RpcError, RpcServerBuilder, TransportBuilder,
    DEFAULT_BROKER_ADDRESS,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    common::init_tracing();

    let hub = MemoryHub::new();
    hub.add_broker(DEFAULT_BROKER_ADDRESS);

    let server_transport = TransportBuilder::new()
        .transport_id("add-server")
        .memory_hub(hub.clone())
        .build()?;
    let server = RpcServerBuilder::new(server_transport)
        .concurrency(8)
        .register_typed(ADD_METHOD, |_ctx, req: AddRequest| async move {
            Ok(AddResponse { z: req.x + req.y })
        })
        .start()
        .await?;

    let client_transport = TransportBuilder::new()
        .transport_id("add-client")
        .memory_hub(hub)
        .build()?;
    let client = RpcClientBuilder::new(client_transport)
        .request_timeout(Duration::from_secs(2))
        .start()
        .await?;

    for (x, y) in [(2, 3), (-1, 1)] {
        let resp: AddResponse = client
            .request_typed(ADD_METHOD, &AddRequest { x, y })
            .await?;
        println!("{x} + {y} = {}", resp.z);
    }

    match client.request("Sub", Bytes::from_static(b"{}")).await {
        Err(RpcError::UnknownMethod(method)) => println!("Sub rejected: unknown method {method}"),
        other => println!("unexpected Sub result: {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
    println!("served: {:?}", server.stats());

    Ok(())
}
