use std::time::Duration;

use super::*;
use crate::bus::{ExchangeKind, MemoryBroker, OutboundMessage};

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

async fn wait_for_generation(transport: &Transport, generation: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let LinkState::Connected { generation: g } = transport.state() {
                if g >= generation {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transport did not reconnect in time");
}

#[tokio::test]
async fn test_connect_retries_until_broker_accepts() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(3);
    let transport = Transport::new(broker.connector(), fast_backoff());

    transport.connect().await.unwrap();

    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(transport.state(), LinkState::Connected { generation: 1 });
}

#[tokio::test]
async fn test_concurrent_connects_share_one_link() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);
    let transport = Transport::new(broker.connector(), fast_backoff());

    let (first, second) = tokio::join!(transport.connect(), transport.connect());
    first.unwrap();
    second.unwrap();

    assert_eq!(broker.link_count(), 1);
    assert_eq!(transport.state(), LinkState::Connected { generation: 1 });

    transport.close().await.unwrap();
    assert_eq!(broker.link_count(), 0);
}

#[tokio::test]
async fn test_channel_unavailable_before_connect() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());

    let err = transport.channel().await.err().unwrap();
    assert!(matches!(err, BusError::Unavailable));
}

#[tokio::test]
async fn test_reconnect_replays_topology_once() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    transport
        .declare_exchange(ExchangeSpec::durable("ari", ExchangeKind::Topic))
        .await
        .unwrap();
    transport.declare_queue(QueueSpec::durable("events")).await.unwrap();
    transport.bind_queue("events", "ari", "#").await.unwrap();

    broker.restart();
    wait_for_generation(&transport, 2).await;

    assert!(broker.queue_exists("events"));
    assert_eq!(broker.declaration_count("exchange:ari"), 2);
    assert_eq!(broker.declaration_count("queue:events"), 2);
    assert_eq!(broker.declaration_count("bind:events:ari:#"), 2);

    // Replayed bindings route again.
    let channel = transport.channel().await.unwrap();
    channel
        .publish("ari", "x.y", OutboundMessage::new(b"e".to_vec()))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("events"), 1);
}

#[tokio::test]
async fn test_replay_order_exchanges_queues_bindings() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    transport.declare_queue(QueueSpec::durable("q")).await.unwrap();
    transport
        .declare_exchange(ExchangeSpec::durable("x", ExchangeKind::Direct))
        .await
        .unwrap();
    transport.bind_queue("q", "x", "k").await.unwrap();
    let before = broker.declarations().len();

    broker.restart();
    wait_for_generation(&transport, 2).await;

    let replayed: Vec<String> = broker.declarations()[before..].to_vec();
    assert_eq!(replayed, vec!["exchange:x", "queue:q", "bind:q:x:k"]);
}

#[tokio::test]
async fn test_server_named_queues_not_recorded() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    let name = transport.declare_queue(QueueSpec::reply()).await.unwrap();
    transport.declare_queue(QueueSpec::durable("keep")).await.unwrap();
    transport.declare_queue(QueueSpec::durable("keep")).await.unwrap();

    let topology = transport.topology().await;
    assert_eq!(topology.queues.len(), 1);
    assert_eq!(topology.queues[0].name, "keep");
    assert!(!topology.queues.iter().any(|q| q.name == name));
}

#[tokio::test]
async fn test_reconnect_after_refused_attempts() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    broker.fail_next_connects(5);
    broker.sever();
    wait_for_generation(&transport, 2).await;

    assert_eq!(broker.connect_attempts(), 7);
    assert_eq!(broker.link_count(), 1);
}

#[tokio::test]
async fn test_wait_connected_resolves_after_reconnect() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    broker.fail_next_connects(3);
    broker.sever();

    let generation = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let g = transport.wait_connected().await.unwrap();
            if g >= 2 {
                return g;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(generation, 2);
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();

    assert_eq!(transport.state(), LinkState::Closed);
    assert!(matches!(transport.channel().await.err(), Some(BusError::Closed)));
    assert!(matches!(transport.wait_connected().await, Err(BusError::Closed)));
    assert!(matches!(transport.connect().await, Err(BusError::Closed)));
    assert_eq!(broker.link_count(), 0);
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    let broker = MemoryBroker::new();
    let transport = Transport::new(broker.connector(), fast_backoff());
    transport.connect().await.unwrap();
    transport.close().await.unwrap();

    broker.sever();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.connect_attempts(), 1);
}
