// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for Deliveries
//!
//! This module extracts trace context that publishers propagated through AMQP
//! message headers and opens a consumer span for each delivery. Without a
//! configured tracer provider the spans are no-ops.

use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use tracing::error;

/// Read-only adapter exposing AMQP headers to OpenTelemetry propagators.
pub(crate) struct AmqpHeaderExtractor<'a> {
    headers: &'a FieldTable,
}

impl<'a> AmqpHeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a FieldTable) -> Self {
        Self { headers }
    }
}

impl Extractor for AmqpHeaderExtractor<'_> {
    /// Gets a trace context value from the message headers.
    ///
    /// Only long-string headers carry propagation values; anything else is ignored.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.inner().get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .inner()
            .keys()
            .map(|header| header.as_str())
            .collect()
    }
}

/// Creates a new consumer span for one delivery.
///
/// # Parameters
/// * `headers` - AMQP headers of the delivery
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (the routing key)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    headers: &FieldTable,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
