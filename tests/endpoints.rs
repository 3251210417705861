use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use queue_rpc::{
    //
    create_memory_transport,
    DiscoveryEndpoints,
    EndpointProvider,
    EndpointProviderPtr,
    HandlerRegistry,
    ManualDiscovery,
    MemoryHub,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    ServerRuntime,
    StaticEndpoints,
    TransportBinding,
};

const GUARD: Duration = Duration::from_secs(10);

fn echo_registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register("Echo", |_ctx, body: Bytes| async move { Ok(body) })
        .build()
}

async fn start_pair(
    hub: &Arc<MemoryHub>,
    endpoints: EndpointProviderPtr,
) -> Result<(ServerRuntime, RpcClient)> {
    // ---
    let server = ServerRuntime::start(
        TransportBinding::new(create_memory_transport("server", hub.clone()), endpoints.clone()),
        echo_registry(),
        RpcConfig::new("server").with_concurrency(4),
    )
    .await?;
    let client = RpcClient::start(
        TransportBinding::new(create_memory_transport("client", hub.clone()), endpoints),
        RpcConfig::new("client"),
    )
    .await?;
    Ok((server, client))
}

/// Call until a reply arrives; endpoint changes are applied asynchronously.
async fn echo_eventually(client: &RpcClient, body: &'static [u8]) -> Bytes {
    // ---
    timeout(GUARD, async {
        loop {
            let attempt = client
                .call("Echo", Bytes::from_static(body), Duration::from_millis(200))
                .await;
            match attempt {
                Ok(reply) => return reply,
                Err(RpcError::Timeout) | Err(RpcError::Transport(_)) => continue,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    })
    .await
    .expect("no reply after endpoint change")
}

#[tokio::test]
async fn test_static_endpoints_from_set() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.add_broker("10.0.0.1:4150");
    let endpoints: EndpointProviderPtr = Arc::new(StaticEndpoints::new(
        queue_rpc::EndpointSet::new("10.0.0.1:4150"),
    ));

    let (server, client) = start_pair(&hub, endpoints).await?;
    let reply = client.request("Echo", Bytes::from_static(b"static")).await?;
    assert_eq!(reply, Bytes::from_static(b"static"));

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_discovery_failure_at_startup_propagates() {
    // ---
    let discovery = ManualDiscovery::new("b:1");
    discovery.set_failure(Some("registry unreachable".into()));

    match DiscoveryEndpoints::new(discovery).await {
        Err(RpcError::Discovery(reason)) => assert!(reason.contains("registry unreachable")),
        Err(other) => panic!("expected Discovery error, got {other}"),
        Ok(_) => panic!("expected Discovery error"),
    }
}

#[tokio::test]
async fn test_broker_change_is_followed_end_to_end() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.add_broker("b:1");
    hub.add_broker("b:2");

    let discovery = ManualDiscovery::new("b:1");
    let endpoints = Arc::new(DiscoveryEndpoints::new(discovery.clone()).await?);
    let (server, client) = start_pair(&hub, endpoints.clone()).await?;

    assert_eq!(echo_eventually(&client, b"before").await, Bytes::from_static(b"before"));

    discovery.set_broker_address("b:2");
    timeout(GUARD, async {
        while endpoints.current().broker_address() != "b:2" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("discovery change never applied");

    // once the old broker is gone, only the new one can carry traffic
    let mut rx = endpoints.watch().expect("discovery endpoints are watchable");
    assert_eq!(rx.borrow_and_update().broker_address(), "b:2");
    assert_eq!(echo_eventually(&client, b"moving").await, Bytes::from_static(b"moving"));
    hub.set_broker_online("b:1", false);
    assert_eq!(echo_eventually(&client, b"after").await, Bytes::from_static(b"after"));

    let moved = hub
        .channel_stats("b:2", "request", "server")
        .expect("server consumes on the new broker");
    assert!(moved.acked >= 1);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_discovery_refresh_failure_keeps_serving() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.add_broker("b:1");

    let discovery = ManualDiscovery::new("b:1");
    let endpoints = Arc::new(DiscoveryEndpoints::new(discovery.clone()).await?);
    let (server, client) = start_pair(&hub, endpoints.clone()).await?;

    discovery.set_failure(Some("registry flapping".into()));
    assert!(matches!(endpoints.refresh().await, Err(RpcError::Discovery(_))));
    assert_eq!(endpoints.current().broker_address(), "b:1");

    let reply = client.request("Echo", Bytes::from_static(b"steady")).await?;
    assert_eq!(reply, Bytes::from_static(b"steady"));

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
