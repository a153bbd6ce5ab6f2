// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handlers
//!
//! The business-logic seam of the consumer. A handler receives each matching
//! delivery, in broker order, one at a time.

use crate::{delivery::Delivery, errors::AmqpError};
use async_trait::async_trait;
use opentelemetry::Context;
use tracing::info;

/// Processes one delivery.
///
/// Returning an error (or panicking) marks the delivery as failed. The failure
/// is logged and the consumer moves on to the next delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Handler that writes each delivery's routing key and body to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl DeliveryHandler for LoggingHandler {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
        info!(delivery_tag = delivery.delivery_tag, "{}", log_line(delivery));

        Ok(())
    }
}

/// `received '<routing key>': '<body>'`, the body decoded lossily as UTF-8.
fn log_line(delivery: &Delivery) -> String {
    format!(
        "received '{}': '{}'",
        delivery.routing_key,
        delivery.body_lossy()
    )
}
