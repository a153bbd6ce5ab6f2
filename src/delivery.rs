// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Acknowledgement
//!
//! A `Delivery` is the broker-independent view of one message handed to a
//! handler. `AckMode` selects who acknowledges it: the broker at delivery time
//! (at-most-once) or the consumer after the handler returns (at-least-once).

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    types::FieldTable,
    Channel,
};
use std::borrow::Cow;
use tracing::error;

/// Acknowledgement policy for a consumer registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The broker treats every message as acknowledged when it is sent. A
    /// failing handler loses the message.
    #[default]
    Auto,
    /// The consumer acks after a successful handler run and rejects otherwise.
    Manual { requeue_on_failure: bool },
}

impl AckMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

/// One message received from the subscription queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub redelivered: bool,
    pub headers: FieldTable,
}

impl Delivery {
    /// Body rendered as UTF-8, replacing invalid sequences.
    pub fn body_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(mut delivery: lapin::message::Delivery) -> Self {
        Delivery {
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            body: std::mem::take(&mut delivery.data),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            redelivered: delivery.redelivered,
        }
    }
}

/// Settles deliveries received in manual acknowledgement mode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms processing of a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Refuses a single delivery, optionally asking the broker to requeue it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError {})
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag, requeue, "error whiling reject msg"
                );
                Err(AmqpError::RejectMessageError {})
            }
            _ => Ok(()),
        }
    }
}
