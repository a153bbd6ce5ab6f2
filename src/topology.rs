// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! This module declares the subscription topology: a durable topic exchange, a
//! private broker-named queue, and one binding between them.
//!
//! The main components are:
//! - `Topology` trait: declaration operations over a channel
//! - `AmqpTopology`: implementation of the Topology trait for RabbitMQ
//! - `declare_subscription`: exchange, then queue, then binding, in that order
//!
//! Declarations are idempotent on the broker. Redeclaring an exchange or queue
//! with different attributes is answered with PRECONDITION_FAILED, reported as
//! `AmqpError::TopologyMismatch`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::QueueBindOptions,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Exchange the consumer subscribes to
pub const USERS_EXCHANGE: &str = "users";
/// Routing pattern: `user.event.` followed by exactly one more word
pub const USER_EVENT_PATTERN: &str = "user.event.*";

/// The durable topic exchange carrying user events.
pub fn users_exchange() -> ExchangeDefinition {
    ExchangeDefinition::new(USERS_EXCHANGE).topic().durable()
}

/// Declaration operations needed to set up a subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares an exchange. Succeeds if an identical exchange already exists.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which the broker generates for
    /// anonymous definitions.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange. Binding twice is a no-op on the broker.
    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

/// A bound subscription queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

/// Declares `exchange`, a fresh anonymous queue, and binds the queue with
/// `pattern`.
pub async fn declare_subscription(
    topology: &dyn Topology,
    exchange: &ExchangeDefinition,
    pattern: &str,
) -> Result<Subscription, AmqpError> {
    topology.declare_exchange(exchange).await?;
    let queue = topology.declare_queue(&QueueDefinition::anonymous()).await?;

    topology
        .bind(
            &QueueBinding::new(&queue)
                .exchange(exchange.name())
                .routing_key(pattern),
        )
        .await?;

    info!(
        exchange = exchange.name(),
        queue, pattern, "subscription declared"
    );

    Ok(Subscription {
        exchange: exchange.name().to_owned(),
        queue,
        pattern: pattern.to_owned(),
    })
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<Channel>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology {
        AmqpTopology { channel }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                def.declare_options(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                if is_precondition_failed(&err) {
                    Err(AmqpError::TopologyMismatch(def.name.clone()))
                } else {
                    Err(AmqpError::DeclareExchangeError(def.name.clone()))
                }
            }
            _ => Ok(()),
        }?;

        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {:?}", def.name);

        match self
            .channel
            .queue_declare(&def.name, def.declare_options(), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare queue");
                if is_precondition_failed(&err) {
                    Err(AmqpError::TopologyMismatch(def.name.clone()))
                } else {
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
            }
            Ok(queue) => {
                let name = queue.name().as_str().to_owned();
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }
}

/// Whether the broker refused a declaration because it conflicts with an
/// existing entity of the same name.
pub(crate) fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}
