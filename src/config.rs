// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! Broker endpoint and consumer settings read from environment variables.
//! Host and password have no defaults: they are deployment secrets and must be
//! supplied explicitly.

use crate::{delivery::AckMode, errors::AmqpError};
use std::{fmt, str::FromStr};
use tracing::error;

pub const RABBITMQ_HOST_ENV: &str = "RABBITMQ_HOST";
pub const RABBITMQ_USER_ENV: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_PORT_ENV: &str = "RABBITMQ_PORT";
pub const RABBITMQ_VHOST_ENV: &str = "RABBITMQ_VHOST";
pub const CONSUMER_NAME_ENV: &str = "CONSUMER_NAME";
pub const CONSUMER_AUTO_ACK_ENV: &str = "CONSUMER_AUTO_ACK";
pub const CONSUMER_REQUEUE_ON_FAILURE_ENV: &str = "CONSUMER_REQUEUE_ON_FAILURE";
pub const CONSUMER_PREFETCH_ENV: &str = "CONSUMER_PREFETCH";

pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_CONSUMER_NAME: &str = "topic-consumer";

/// Immutable connection parameters for the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub vhost: String,
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"***")
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Everything the consumer binary needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub name: String,
    pub endpoint: BrokerEndpoint,
    pub ack_mode: AckMode,
    pub prefetch: Option<u16>,
}

impl ConsumerConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let endpoint = BrokerEndpoint {
            host: required(&get, RABBITMQ_HOST_ENV)?,
            user: get(RABBITMQ_USER_ENV).unwrap_or_else(|| DEFAULT_USER.to_owned()),
            password: required(&get, RABBITMQ_PASSWORD_ENV)?,
            port: parsed(&get, RABBITMQ_PORT_ENV)?.unwrap_or(DEFAULT_PORT),
            vhost: get(RABBITMQ_VHOST_ENV).unwrap_or_else(|| DEFAULT_VHOST.to_owned()),
        };

        let auto_ack = parsed::<bool, _>(&get, CONSUMER_AUTO_ACK_ENV)?.unwrap_or(true);
        let ack_mode = if auto_ack {
            AckMode::Auto
        } else {
            AckMode::Manual {
                requeue_on_failure: parsed(&get, CONSUMER_REQUEUE_ON_FAILURE_ENV)?
                    .unwrap_or(false),
            }
        };

        Ok(ConsumerConfig {
            name: get(CONSUMER_NAME_ENV).unwrap_or_else(|| DEFAULT_CONSUMER_NAME.to_owned()),
            endpoint,
            ack_mode,
            prefetch: parsed(&get, CONSUMER_PREFETCH_ENV)?,
        })
    }
}

fn required<F>(get: &F, key: &str) -> Result<String, AmqpError>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| {
        error!(key, "missing required configuration");
        AmqpError::ConfigError(key.to_owned())
    })
}

fn parsed<T, F>(get: &F, key: &str) -> Result<Option<T>, AmqpError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                error!(key, value = %raw, "invalid configuration value");
                Err(AmqpError::ConfigError(key.to_owned()))
            }
        },
    }
}
