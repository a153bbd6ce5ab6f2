// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module processes one delivery: it opens a trace span, runs the handler
//! with panic containment, and settles the message according to the ack mode.
//! A failure never escapes as anything but a returned `AmqpError`, so the
//! receive loop keeps going.

use crate::{
    delivery::{AckMode, Acknowledger, Delivery},
    errors::AmqpError,
    handler::DeliveryHandler,
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    KeyValue,
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Consumes and processes a single delivery.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `delivery` - The delivery to hand to the handler
/// * `handler` - Business logic for the delivery
/// * `acker` - Settles the delivery in manual mode; unused in auto mode
/// * `ack_mode` - Acknowledgement policy of the consumer registration
///
/// # Returns
/// Ok(()) when the handler succeeded and the delivery was settled, otherwise
/// the handler or acknowledgement error
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    handler: &dyn DeliveryHandler,
    acker: &dyn Acknowledger,
    ack_mode: AckMode,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.routing_key);
    span.set_attribute(KeyValue::new(
        "messaging.rabbitmq.destination.routing_key",
        delivery.routing_key.clone(),
    ));
    span.set_attribute(KeyValue::new(
        "messaging.message.delivery_tag",
        delivery.delivery_tag as i64,
    ));

    debug!(
        routing_key = %delivery.routing_key,
        exchange = %delivery.exchange,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "received"
    );

    let outcome = match AssertUnwindSafe(async { handler.exec(&ctx, delivery).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(AmqpError::HandlerFailure(panic_message(panic))),
    };

    let outcome = outcome.map_err(|err| match err {
        AmqpError::HandlerFailure(msg) => AmqpError::HandlerFailure(msg),
        other => AmqpError::HandlerFailure(other.to_string()),
    });

    if let Err(err) = &outcome {
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }

    match ack_mode {
        AckMode::Auto => match outcome {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                // already acknowledged by the broker, the message is gone
                error!(
                    error = err.to_string(),
                    routing_key = %delivery.routing_key,
                    delivery_tag = delivery.delivery_tag,
                    "handler failure, message dropped"
                );
                Err(err)
            }
        },

        AckMode::Manual { requeue_on_failure } => match outcome {
            Ok(()) => {
                debug!("message successfully processed");
                match acker.ack(delivery.delivery_tag).await {
                    Err(e) => {
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                        Err(e)
                    }
                    _ => {
                        span.set_status(Status::Ok);
                        Ok(())
                    }
                }
            }
            Err(err) => {
                if requeue_on_failure {
                    warn!(
                        error = err.to_string(),
                        routing_key = %delivery.routing_key,
                        "handler failure, requeuing message"
                    );
                } else {
                    error!(
                        error = err.to_string(),
                        routing_key = %delivery.routing_key,
                        "handler failure, rejecting message"
                    );
                }

                if let Err(e) = acker.reject(delivery.delivery_tag, requeue_on_failure).await {
                    span.record_error(&e);
                }

                Err(err)
            }
        },
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_owned()
    }
}
