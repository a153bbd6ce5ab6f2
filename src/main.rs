// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::{process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use topic_consumer::{
    app, config::ConsumerConfig, errors::AmqpError, handler::LoggingHandler,
    shutdown::ShutdownCoordinator,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    info!("starting topic consumer...");

    let config = match ConsumerConfig::from_env() {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(name = config.name, endpoint = ?config.endpoint, "configuration loaded");

    let coordinator = ShutdownCoordinator::new(CancellationToken::new());
    let listener = coordinator.listen_for_interrupt();

    let outcome = app::run(config, &coordinator, Arc::new(LoggingHandler)).await;

    // releases the listener when startup failed before any signal
    coordinator.shutdown();
    let listened = match listener.await {
        Ok(res) => res,
        Err(err) => {
            error!(error = err.to_string(), "tokio process error");
            Err(AmqpError::InternalError)
        }
    };

    match outcome.and_then(|stats| listened.map(|_| stats)) {
        Ok(stats) => {
            info!(
                dispatched = stats.dispatched,
                failed = stats.failed,
                "goodbye"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), "consumer terminated with error");
            ExitCode::FAILURE
        }
    }
}
