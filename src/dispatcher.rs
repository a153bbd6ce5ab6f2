// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! This module registers a consumer on the subscription queue and runs the
//! receive loop that hands each delivery to the handler.
//!
//! Deliveries are dispatched one at a time in the order the broker sent them:
//! the next delivery is not pulled from the stream until the handler for the
//! current one has returned. Stopping is cooperative. Once cancellation is
//! requested nothing new is dispatched, and a handler already running is
//! allowed to finish.

use crate::{
    consumer::consume,
    delivery::{AckMode, Acknowledger, Delivery},
    errors::AmqpError,
    handler::DeliveryHandler,
    shutdown::Stoppable,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::global;
use std::{fmt::Display, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counters reported when the receive loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handed to the handler
    pub dispatched: u64,
    /// Deliveries whose handler failed or whose settlement failed
    pub failed: u64,
    /// Whether the delivery stream ended without a stop request
    pub connection_lost: bool,
}

/// Registers consumers on a channel.
pub struct ConsumerLoop {
    channel: Arc<Channel>,
}

impl ConsumerLoop {
    pub fn new(channel: Arc<Channel>) -> Self {
        ConsumerLoop { channel }
    }

    /// Registers an exclusive consumer on `queue` and starts dispatching.
    ///
    /// In auto mode the broker acknowledges on delivery (`no_ack`). In manual
    /// mode `prefetch`, when set, bounds the unacknowledged deliveries held by
    /// this consumer.
    ///
    /// # Returns
    /// The handle of the active subscription
    pub async fn start(
        &self,
        queue: &str,
        ack_mode: AckMode,
        prefetch: Option<u16>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        if let (AckMode::Manual { .. }, Some(count)) = (ack_mode, prefetch) {
            match self
                .channel
                .basic_qos(count, BasicQosOptions { global: false })
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "failure to configure qos");
                    Err(AmqpError::QoSDeclarationError(err.to_string()))
                }
                Ok(c) => Ok(c),
            }?;
        }

        let tag = format!("consumer-{}", Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: ack_mode.is_auto(),
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(tag, queue, ?ack_mode, "consumer registered, waiting for messages");

        let deliveries = consumer.map(|result| result.map(Delivery::from));
        let acker: Arc<dyn Acknowledger> = self.channel.clone();
        let canceller: Arc<dyn ConsumerCanceller> = self.channel.clone();

        Ok(ConsumerHandle::spawn(tag, ack_mode, canceller, deliveries, handler, acker))
    }
}

/// Broker side of a consumer registration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerCanceller: Send + Sync {
    /// Sends basic.cancel for `tag`. A closed channel has nothing to cancel.
    async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError>;
}

#[async_trait]
impl ConsumerCanceller for Channel {
    async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError> {
        if !self.status().connected() {
            return Ok(());
        }

        match self
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), tag, "failure to cancel consumer");
                Err(AmqpError::ConsumerCancelError(tag.to_owned()))
            }
            _ => Ok(()),
        }
    }
}

/// The active subscription: consumer tag and the task running the receive
/// loop.
pub struct ConsumerHandle {
    tag: String,
    canceller: Arc<dyn ConsumerCanceller>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<ConsumerStats>>>,
}

impl ConsumerHandle {
    pub(crate) fn spawn<S, E>(
        tag: String,
        ack_mode: AckMode,
        canceller: Arc<dyn ConsumerCanceller>,
        deliveries: S,
        handler: Arc<dyn DeliveryHandler>,
        acker: Arc<dyn Acknowledger>,
    ) -> ConsumerHandle
    where
        S: Stream<Item = Result<Delivery, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatch(
            deliveries,
            cancel.clone(),
            handler,
            acker,
            ack_mode,
        ));

        ConsumerHandle {
            tag,
            canceller,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Cancels the subscription and waits for the in-flight delivery.
    ///
    /// The loop stops pulling deliveries before basic.cancel is sent. A failed
    /// basic.cancel is logged only: the local loop is already stopped and the
    /// broker drops the registration when the channel closes. Calling `stop`
    /// again returns empty stats.
    pub async fn stop(&self) -> Result<ConsumerStats, AmqpError> {
        let Some(task) = self.task.lock().await.take() else {
            debug!(tag = self.tag, "consumer already stopped");
            return Ok(ConsumerStats::default());
        };

        self.cancel.cancel();

        if let Err(err) = self.canceller.cancel_consumer(&self.tag).await {
            warn!(error = err.to_string(), tag = self.tag, "draining without basic.cancel");
        }

        let stats = match task.await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = err.to_string(), "tokio process error");
                return Err(AmqpError::InternalError);
            }
        };

        info!(
            tag = self.tag,
            dispatched = stats.dispatched,
            failed = stats.failed,
            "consumer stopped"
        );

        Ok(stats)
    }
}

#[async_trait]
impl Stoppable for ConsumerHandle {
    async fn stop(&self) -> Result<ConsumerStats, AmqpError> {
        ConsumerHandle::stop(self).await
    }
}

async fn dispatch<S, E>(
    deliveries: S,
    cancel: CancellationToken,
    handler: Arc<dyn DeliveryHandler>,
    acker: Arc<dyn Acknowledger>,
    ack_mode: AckMode,
) -> ConsumerStats
where
    S: Stream<Item = Result<Delivery, E>> + Send,
    E: Display,
{
    let tracer = global::tracer("amqp consumer");
    let mut deliveries = Box::pin(deliveries);
    let mut stats = ConsumerStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("consumer cancelled, no new deliveries are dispatched");
                break;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                stats.dispatched += 1;
                if consume(
                    &tracer,
                    &delivery,
                    handler.as_ref(),
                    acker.as_ref(),
                    ack_mode,
                )
                .await
                .is_err()
                {
                    stats.failed += 1;
                }
            }

            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),

            None => {
                warn!(error = %AmqpError::ConnectionLost, "delivery stream ended");
                stats.connection_lost = true;
                break;
            }
        }
    }

    stats
}
