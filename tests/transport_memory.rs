use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use queue_rpc::{
    //
    create_memory_transport,
    Consumer,
    ConsumerPtr,
    Endpoint,
    MemoryHub,
    Producer,
    Result,
    RpcError,
    Topic,
    Transport,
    TransportPtr,
};

const BROKER: &str = "127.0.0.1:4150";
const GUARD: Duration = Duration::from_secs(5);

fn setup() -> (Arc<MemoryHub>, TransportPtr) {
    let hub = MemoryHub::new();
    hub.add_broker(BROKER);
    let transport = create_memory_transport("memory-test", hub.clone());
    (hub, transport)
}

async fn consumer(transport: &TransportPtr, topic: &str, channel: &str) -> Result<ConsumerPtr> {
    let consumer = transport.consumer(topic.into(), channel.into(), 4).await?;
    consumer.connect(&Endpoint::Broker(BROKER.into())).await?;
    Ok(consumer)
}

async fn publish(transport: &TransportPtr, topic: &str, body: &'static [u8]) -> Result<()> {
    let producer = transport.producer(BROKER).await?;
    producer.publish(&Topic::from(topic), Bytes::from_static(body)).await
}

#[tokio::test]
async fn test_ack_removes_message() -> Result<()> {
    // ---
    let (hub, transport) = setup();
    let consumer = consumer(&transport, "jobs", "workers").await?;
    publish(&transport, "jobs", b"one").await?;

    let delivery = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body(), &Bytes::from_static(b"one"));
    assert_eq!(delivery.attempts(), 1);
    delivery.ack();

    let stats = hub.channel_stats(BROKER, "jobs", "workers").unwrap();
    assert_eq!((stats.ready, stats.in_flight, stats.acked), (0, 0, 1));

    consumer.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_delivery_is_requeued() -> Result<()> {
    // ---
    let (hub, transport) = setup();
    let consumer = consumer(&transport, "jobs", "workers").await?;
    publish(&transport, "jobs", b"fragile").await?;

    let delivery = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
    drop(delivery);

    let again = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
    assert_eq!(again.body(), &Bytes::from_static(b"fragile"));
    assert_eq!(again.attempts(), 2);
    again.ack();

    let stats = hub.channel_stats(BROKER, "jobs", "workers").unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.acked, 1);

    consumer.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_delayed_requeue() -> Result<()> {
    // ---
    let (hub, transport) = setup();
    let consumer = consumer(&transport, "jobs", "workers").await?;
    publish(&transport, "jobs", b"later").await?;

    let delivery = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
    delivery.requeue(Duration::from_millis(100));

    // not back before the delay
    assert!(timeout(Duration::from_millis(20), consumer.recv()).await.is_err());

    let again = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
    assert_eq!(again.attempts(), 2);
    again.ack();
    assert_eq!(hub.channel_stats(BROKER, "jobs", "workers").unwrap().acked, 1);

    consumer.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_topic_fans_out_to_every_channel() -> Result<()> {
    // ---
    let (_hub, transport) = setup();
    let audit = consumer(&transport, "events", "audit").await?;
    let billing = consumer(&transport, "events", "billing").await?;
    publish(&transport, "events", b"created").await?;

    for consumer in [&audit, &billing] {
        let delivery = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
        assert_eq!(delivery.body(), &Bytes::from_static(b"created"));
        delivery.ack();
    }

    audit.stop().await;
    billing.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_channel_members_share_messages() -> Result<()> {
    // ---
    let (hub, transport) = setup();
    let a = consumer(&transport, "jobs", "workers").await?;
    let b = consumer(&transport, "jobs", "workers").await?;

    for _ in 0..10 {
        publish(&transport, "jobs", b"job").await?;
    }

    let mut received = 0;
    while received < 10 {
        let delivery = tokio::select! {
            Some(d) = a.recv() => d,
            Some(d) = b.recv() => d,
            _ = tokio::time::sleep(GUARD) => panic!("messages went missing"),
        };
        delivery.ack();
        received += 1;
    }

    // each message went to exactly one member
    let stats = hub.channel_stats(BROKER, "jobs", "workers").unwrap();
    assert_eq!(stats.acked, 10);
    assert_eq!(stats.ready + stats.in_flight, 0);

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_lookup_connects_to_listed_brokers() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.add_broker("b:1");
    hub.add_broker("b:2");
    hub.register_lookup("lookup:1", vec!["b:1".into(), "b:2".into()]);
    let transport = create_memory_transport("lookup-test", hub.clone());

    let consumer = transport.consumer("jobs".into(), "workers".into(), 4).await?;
    consumer.connect(&Endpoint::Lookup("lookup:1".into())).await?;

    for broker in ["b:1", "b:2"] {
        let producer = transport.producer(broker).await?;
        producer.publish(&"jobs".into(), Bytes::from(broker)).await?;
    }

    let mut bodies = Vec::new();
    for _ in 0..2 {
        let delivery = timeout(GUARD, consumer.recv()).await.unwrap().unwrap();
        bodies.push(delivery.body().clone());
        delivery.ack();
    }
    bodies.sort();
    assert_eq!(bodies, vec![Bytes::from("b:1"), Bytes::from("b:2")]);

    consumer.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_lookup_is_connect_error() {
    // ---
    let (_hub, transport) = setup();
    let consumer = transport
        .consumer("jobs".into(), "workers".into(), 4)
        .await
        .unwrap();
    let result = consumer.connect(&Endpoint::Lookup("nowhere:4161".into())).await;
    assert!(matches!(result, Err(RpcError::Connect(_))));
    consumer.stop().await;
}
