// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the network connection to RabbitMQ and the single logical
//! channel multiplexed over it. The connection and channel live for the whole
//! run and are released by `ConnectionManager::close`, which is safe to call any
//! number of times.

use crate::{config::BrokerEndpoint, errors::AmqpError, shutdown::Closable};
use async_trait::async_trait;
use lapin::{
    types::LongString,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Owner of the broker connection and its channel.
pub struct ConnectionManager {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Connects to the broker and opens one channel.
    ///
    /// Failures here are fatal at startup: no retry is attempted.
    ///
    /// # Parameters
    /// * `name` - Connection name reported to the broker
    /// * `endpoint` - Host, port, vhost and credentials
    ///
    /// # Returns
    /// The open manager, or `ConnectionError`/`ChannelError`
    pub async fn open(name: &str, endpoint: &BrokerEndpoint) -> Result<Self, AmqpError> {
        let (connection, channel) = new_amqp_channel(name, endpoint).await?;

        Ok(ConnectionManager {
            connection,
            channel,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// Closes the channel and then the connection.
    ///
    /// Only the first call does any work; later calls return `Ok(())`. A channel
    /// or connection already closed by the broker is skipped.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("connection already closed");
            return Ok(());
        }

        let mut result = Ok(());

        if self.channel.status().connected() {
            debug!("closing amqp channel...");
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "consumer shutdown").await {
                error!(error = err.to_string(), "failure to close the channel");
                result = Err(AmqpError::CloseError(err.to_string()));
            }
        }

        if self.connection.status().connected() {
            debug!("closing amqp connection...");
            if let Err(err) = self
                .connection
                .close(REPLY_SUCCESS, "consumer shutdown")
                .await
            {
                error!(error = err.to_string(), "failure to close the connection");
                if result.is_ok() {
                    result = Err(AmqpError::CloseError(err.to_string()));
                }
            }
        }

        info!("amqp connection closed");
        result
    }
}

#[async_trait]
impl Closable for ConnectionManager {
    async fn close(&self) -> Result<(), AmqpError> {
        ConnectionManager::close(self).await
    }
}

/// Creates a new AMQP connection and channel.
///
/// The URI is built structurally so credentials are never interpolated into a
/// string that could end up in a log line.
pub async fn new_amqp_channel(
    name: &str,
    endpoint: &BrokerEndpoint,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(
        host = %endpoint.host,
        port = endpoint.port,
        vhost = %endpoint.vhost,
        "creating amqp connection..."
    );
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    let conn = match Connection::connect_uri(amqp_uri(endpoint), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

pub(crate) fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.user.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.vhost.clone(),
        ..Default::default()
    }
}
