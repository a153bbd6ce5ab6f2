// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Application
//!
//! Composes the consumer at startup and tears it down in reverse order:
//! connect, declare the `users` subscription, start consuming, then block on
//! the shutdown coordinator.

use crate::{
    channel::ConnectionManager,
    config::ConsumerConfig,
    dispatcher::{ConsumerLoop, ConsumerStats},
    errors::AmqpError,
    handler::DeliveryHandler,
    shutdown::ShutdownCoordinator,
    topology::{declare_subscription, users_exchange, AmqpTopology, USER_EVENT_PATTERN},
};
use std::sync::Arc;
use tracing::info;

/// Runs the consumer until `coordinator` is asked to shut down.
///
/// Startup errors are returned as-is after closing whatever was opened.
pub async fn run(
    config: ConsumerConfig,
    coordinator: &ShutdownCoordinator,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<ConsumerStats, AmqpError> {
    let connection = ConnectionManager::open(&config.name, &config.endpoint).await?;

    let topology = AmqpTopology::new(connection.channel());
    let subscription =
        match declare_subscription(&topology, &users_exchange(), USER_EVENT_PATTERN).await {
            Ok(s) => s,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

    let consumer = match ConsumerLoop::new(connection.channel())
        .start(
            &subscription.queue,
            config.ack_mode,
            config.prefetch,
            handler,
        )
        .await
    {
        Ok(c) => c,
        Err(err) => {
            let _ = connection.close().await;
            return Err(err);
        }
    };

    info!(
        exchange = subscription.exchange,
        pattern = subscription.pattern,
        "waiting for messages, press Ctrl+C to exit"
    );

    coordinator.run_until_shutdown(&consumer, &connection).await
}
