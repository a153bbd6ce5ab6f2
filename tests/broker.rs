// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Tests against a live RabbitMQ.
//!
//! Run with `cargo test -- --ignored` and the same `RABBITMQ_*` variables the
//! binary reads (`RABBITMQ_HOST` and `RABBITMQ_PASSWORD` at least).

use async_trait::async_trait;
use lapin::{options::BasicPublishOptions, BasicProperties};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use topic_consumer::{
    channel::ConnectionManager,
    config::ConsumerConfig,
    delivery::{AckMode, Delivery},
    dispatcher::ConsumerLoop,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::DeliveryHandler,
    queue::QueueBinding,
    shutdown::{ShutdownCoordinator, ShutdownState},
    topology::{
        declare_subscription, users_exchange, AmqpTopology, Subscription, Topology,
        USERS_EXCHANGE, USER_EVENT_PATTERN,
    },
};

struct Forward {
    tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
    fail_with_body: Option<Vec<u8>>,
}

#[async_trait]
impl DeliveryHandler for Forward {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        let _ = self
            .tx
            .send((delivery.routing_key.clone(), delivery.body.clone()));
        if self.fail_with_body.as_deref() == Some(delivery.body.as_slice()) {
            return Err(AmqpError::HandlerFailure("simulated crash".to_owned()));
        }
        Ok(())
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig::from_env().expect("RABBITMQ_HOST and RABBITMQ_PASSWORD must be set")
}

async fn connect() -> ConnectionManager {
    let cfg = config();
    ConnectionManager::open("topic-consumer-it", &cfg.endpoint)
        .await
        .unwrap()
}

async fn subscribe(conn: &ConnectionManager) -> Subscription {
    let topology = AmqpTopology::new(conn.channel());
    declare_subscription(&topology, &users_exchange(), USER_EVENT_PATTERN)
        .await
        .unwrap()
}

async fn publish(conn: &ConnectionManager, routing_key: &str, body: &[u8]) {
    conn.channel()
        .basic_publish(
            USERS_EXCHANGE,
            routing_key,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default(),
        )
        .await
        .unwrap()
        .await
        .unwrap();
}

async fn drain(
    rx: &mut mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    wait: Duration,
) -> Vec<(String, Vec<u8>)> {
    let mut out = vec![];
    while let Ok(Some(item)) = tokio::time::timeout(wait, rx.recv()).await {
        out.push(item);
    }
    out
}

#[tokio::test]
#[ignore]
async fn matching_keys_are_delivered_once_and_in_order() {
    let conn = connect().await;
    let sub = subscribe(&conn).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx,
                fail_with_body: None,
            }),
        )
        .await
        .unwrap();

    let publisher = connect().await;
    for i in 0..10 {
        publish(&publisher, "user.event.created", format!(r#"{{"id":{}}}"#, i).as_bytes()).await;
    }
    publish(&publisher, "user.event.deleted", br#"{"id":1}"#).await;

    let received = drain(&mut rx, Duration::from_millis(500)).await;
    assert_eq!(received.len(), 11);
    for (i, (key, body)) in received.iter().take(10).enumerate() {
        assert_eq!(key, "user.event.created");
        assert_eq!(body, format!(r#"{{"id":{}}}"#, i).as_bytes());
    }
    assert_eq!(received[10].0, "user.event.deleted");

    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.dispatched, 11);
    conn.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn non_matching_keys_are_not_delivered() {
    let conn = connect().await;
    let sub = subscribe(&conn).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx,
                fail_with_body: None,
            }),
        )
        .await
        .unwrap();

    let publisher = connect().await;
    for key in ["user.login", "order.event.created", "user.event", "user.event.created.v2"] {
        publish(&publisher, key, br#"{"id":1}"#).await;
    }

    assert!(drain(&mut rx, Duration::from_millis(500)).await.is_empty());

    handle.stop().await.unwrap();
    conn.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn redeclaring_topology_is_idempotent() {
    let conn = connect().await;
    let topology = AmqpTopology::new(conn.channel());
    let sub = subscribe(&conn).await;

    topology.declare_exchange(&users_exchange()).await.unwrap();
    let binding = QueueBinding::new(&sub.queue)
        .exchange(USERS_EXCHANGE)
        .routing_key(USER_EVENT_PATTERN);
    topology.bind(&binding).await.unwrap();
    topology.bind(&binding).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx,
                fail_with_body: None,
            }),
        )
        .await
        .unwrap();

    let publisher = connect().await;
    publish(&publisher, "user.event.updated", br#"{"id":2}"#).await;

    // a duplicated binding would deliver twice
    assert_eq!(drain(&mut rx, Duration::from_millis(500)).await.len(), 1);

    handle.stop().await.unwrap();
    conn.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn conflicting_exchange_redeclaration_is_a_mismatch() {
    let conn = connect().await;
    subscribe(&conn).await;

    let topology = AmqpTopology::new(conn.channel());
    // same name and kind, but not durable
    let conflicting = ExchangeDefinition::new(USERS_EXCHANGE).topic();
    let res = topology.declare_exchange(&conflicting).await;

    assert_eq!(res, Err(AmqpError::TopologyMismatch(USERS_EXCHANGE.to_owned())));
    conn.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn auto_acked_message_is_not_redelivered_after_handler_failure() {
    let conn = connect().await;
    let sub = subscribe(&conn).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let poison = br#"{"id":"poison"}"#.to_vec();

    let first = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx: tx.clone(),
                fail_with_body: Some(poison.clone()),
            }),
        )
        .await
        .unwrap();

    let publisher = connect().await;
    publish(&publisher, "user.event.created", &poison).await;

    assert_eq!(drain(&mut rx, Duration::from_millis(500)).await.len(), 1);
    let stats = first.stop().await.unwrap();
    assert_eq!(stats.failed, 1);

    let second = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx,
                fail_with_body: None,
            }),
        )
        .await
        .unwrap();

    assert!(drain(&mut rx, Duration::from_millis(500)).await.is_empty());

    second.stop().await.unwrap();
    conn.close().await.unwrap();
    publisher.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn shutdown_request_drains_and_closes() {
    let conn = connect().await;
    let sub = subscribe(&conn).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConsumerLoop::new(conn.channel())
        .start(
            &sub.queue,
            AckMode::Auto,
            None,
            Arc::new(Forward {
                tx,
                fail_with_body: None,
            }),
        )
        .await
        .unwrap();

    let publisher = connect().await;
    publish(&publisher, "user.event.created", br#"{"id":1}"#).await;
    assert_eq!(drain(&mut rx, Duration::from_millis(500)).await.len(), 1);

    let coordinator = ShutdownCoordinator::new(CancellationToken::new());
    coordinator.shutdown();
    let stats = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.run_until_shutdown(&handle, &conn),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(stats.dispatched, 1);
    assert_eq!(coordinator.state(), ShutdownState::Closed);
    assert!(!conn.connection().status().connected());

    // closing again is a no-op
    assert_eq!(conn.close().await, Ok(()));
    publisher.close().await.unwrap();
}
