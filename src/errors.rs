// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topic Consumer
//!
//! This module provides the error type shared by every stage of the consumer
//! lifecycle: configuration, connection, topology declaration, consumption and
//! shutdown. Startup variants are fatal; `HandlerFailure` is contained at the
//! delivery boundary and never stops the consumer loop.

use thiserror::Error;

/// Represents errors that can occur while running the topic consumer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A required configuration key is missing or could not be parsed
    #[error("missing or invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// An exchange or queue already exists with incompatible attributes
    #[error("topology mismatch for `{0}`: already declared with incompatible attributes")]
    TopologyMismatch(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error cancelling an active consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// The delivery handler returned an error or panicked
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The broker link dropped after startup
    #[error("connection lost")]
    ConnectionLost,

    /// The process could not install its termination signal listener
    #[error("failure to listen for termination signals: {0}")]
    SignalError(String),

    /// Error closing the channel or the connection
    #[error("failure to close: {0}")]
    CloseError(String),
}
