// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Graceful Shutdown
//!
//! The coordinator blocks the main flow until a termination request arrives and
//! then tears the consumer down in order: stop consuming and drain the in-flight
//! delivery, then close the channel and the connection.
//!
//! The termination request is a `CancellationToken` shared between the signal
//! listener and the blocked main flow. Progress is published on a `watch`
//! channel as `Running → ShutdownRequested → Draining → Closed`.

use crate::{dispatcher::ConsumerStats, errors::AmqpError};
use async_trait::async_trait;
use futures_util::future;
use std::{future::Future, io};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle stage of the consumer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    Draining,
    Closed,
}

/// Something that stops receiving work and waits for in-flight work.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> Result<ConsumerStats, AmqpError>;
}

/// Something that releases a broker resource. Closing twice is a no-op.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Closable: Send + Sync {
    async fn close(&self) -> Result<(), AmqpError>;
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        ShutdownCoordinator { token, state }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Requests shutdown without an external signal.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Spawns the task that turns the first interrupt (Ctrl+C, or SIGTERM on
    /// unix) into a shutdown request.
    ///
    /// Once the listener is installed the runtime owns the signal, so the
    /// default immediate termination no longer happens. If no signal can be
    /// listened for, shutdown is requested at once and the task resolves to
    /// `AmqpError::SignalError`.
    pub fn listen_for_interrupt(&self) -> JoinHandle<Result<(), AmqpError>> {
        spawn_listener(self.token.clone(), wait_for_signal())
    }

    /// Blocks until shutdown is requested, then stops the consumer and closes
    /// the connection.
    ///
    /// The connection is closed even when stopping the consumer fails; the
    /// first error is returned after the state reaches `Closed`.
    pub async fn run_until_shutdown(
        &self,
        consumer: &dyn Stoppable,
        connection: &dyn Closable,
    ) -> Result<ConsumerStats, AmqpError> {
        self.token.cancelled().await;
        self.transition(ShutdownState::ShutdownRequested);
        // observers get to run before teardown starts
        tokio::task::yield_now().await;

        self.transition(ShutdownState::Draining);
        let stopped = consumer.stop().await;
        if let Err(err) = &stopped {
            error!(error = err.to_string(), "failure to stop the consumer");
        }

        let closed = connection.close().await;
        self.transition(ShutdownState::Closed);

        let stats = stopped?;
        closed?;

        info!(
            dispatched = stats.dispatched,
            failed = stats.failed,
            "consumer shut down"
        );
        Ok(stats)
    }

    fn transition(&self, next: ShutdownState) {
        let prev = self.state.send_replace(next);
        info!("shutdown state: {:?} -> {:?}", prev, next);
    }
}

fn spawn_listener<F>(token: CancellationToken, signal: F) -> JoinHandle<Result<(), AmqpError>>
where
    F: Future<Output = io::Result<&'static str>> + Send + 'static,
{
    tokio::spawn(async move {
        let received = tokio::select! {
            res = signal => res,
            _ = token.cancelled() => return Ok(()),
        };

        let res = match received {
            Ok(source) => {
                info!(source, "termination signal received");
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "failure to listen for signals, shutting down"
                );
                Err(AmqpError::SignalError(err.to_string()))
            }
        };

        // nothing else would release the blocked main flow
        token.cancel();
        res
    })
}

/// Resolves on the first of Ctrl+C or `terminate`.
///
/// The two listeners are independent: a `terminate` listener that could not
/// be installed leaves Ctrl+C working.
async fn first_signal<I, T>(interrupt: I, terminate: io::Result<T>) -> io::Result<&'static str>
where
    I: Future<Output = io::Result<()>>,
    T: Future<Output = ()>,
{
    let terminate = async {
        match terminate {
            Ok(received) => received.await,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    "failure to listen for SIGTERM, only Ctrl+C stops the consumer"
                );
                future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        res = interrupt => res.map(|_| "SIGINT"),
        _ = terminate => Ok("SIGTERM"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = signal(SignalKind::terminate()).map(|mut stream| async move {
        stream.recv().await;
    });
    first_signal(tokio::signal::ctrl_c(), terminate).await
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    first_signal(tokio::signal::ctrl_c(), Ok(future::pending::<()>())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::time::Duration;

    fn stats() -> ConsumerStats {
        ConsumerStats {
            dispatched: 3,
            failed: 1,
            connection_lost: false,
        }
    }

    #[tokio::test]
    async fn blocks_until_shutdown_is_requested() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let mut consumer = MockStoppable::new();
        consumer.expect_stop().times(1).returning(|| Ok(stats()));
        let mut connection = MockClosable::new();
        connection.expect_close().times(1).returning(|| Ok(()));

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.run_until_shutdown(&consumer, &connection),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(coordinator.state(), ShutdownState::Running);

        coordinator.shutdown();
        let res = coordinator.run_until_shutdown(&consumer, &connection).await;

        assert_eq!(res, Ok(stats()));
        assert_eq!(coordinator.state(), ShutdownState::Closed);
    }

    #[tokio::test]
    async fn drains_consumer_before_closing_connection() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let mut seq = Sequence::new();

        let during_stop = coordinator.subscribe();
        let mut consumer = MockStoppable::new();
        consumer
            .expect_stop()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                assert_eq!(*during_stop.borrow(), ShutdownState::Draining);
                Ok(stats())
            });

        let during_close = coordinator.subscribe();
        let mut connection = MockClosable::new();
        connection
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                assert_eq!(*during_close.borrow(), ShutdownState::Draining);
                Ok(())
            });

        coordinator.token().cancel();
        let res = coordinator.run_until_shutdown(&consumer, &connection).await;

        assert!(res.is_ok());
        assert_eq!(coordinator.state(), ShutdownState::Closed);
    }

    #[tokio::test]
    async fn closes_connection_even_if_stop_fails() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let mut consumer = MockStoppable::new();
        consumer
            .expect_stop()
            .returning(|| Err(AmqpError::InternalError));
        let mut connection = MockClosable::new();
        connection.expect_close().times(1).returning(|| Ok(()));

        coordinator.shutdown();
        let res = coordinator.run_until_shutdown(&consumer, &connection).await;

        assert_eq!(res, Err(AmqpError::InternalError));
        assert_eq!(coordinator.state(), ShutdownState::Closed);
    }

    #[tokio::test]
    async fn close_failure_is_reported() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let mut consumer = MockStoppable::new();
        consumer.expect_stop().returning(|| Ok(stats()));
        let mut connection = MockClosable::new();
        connection
            .expect_close()
            .returning(|| Err(AmqpError::CloseError("socket".to_owned())));

        coordinator.shutdown();
        let res = coordinator.run_until_shutdown(&consumer, &connection).await;

        assert_eq!(res, Err(AmqpError::CloseError("socket".to_owned())));
    }

    #[tokio::test]
    async fn interrupt_listener_exits_on_programmatic_shutdown() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let listener = coordinator.listen_for_interrupt();

        coordinator.shutdown();

        let joined = tokio::time::timeout(Duration::from_secs(1), listener).await;
        assert!(matches!(joined, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn received_signal_requests_shutdown() {
        let token = CancellationToken::new();
        let listener = spawn_listener(token.clone(), async { Ok::<_, io::Error>("SIGTERM") });

        assert_eq!(listener.await.unwrap(), Ok(()));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn signal_listener_failure_requests_shutdown_and_is_reported() {
        let token = CancellationToken::new();
        let listener = spawn_listener(token.clone(), async {
            Err(io::Error::new(io::ErrorKind::Other, "no signal driver"))
        });

        assert_eq!(
            listener.await.unwrap(),
            Err(AmqpError::SignalError("no signal driver".to_owned()))
        );
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn interrupt_is_heard_when_terminate_listener_fails() {
        let unavailable = Err::<future::Pending<()>, _>(io::Error::new(
            io::ErrorKind::Other,
            "signal driver gone",
        ));

        let res = first_signal(async { Ok::<_, io::Error>(()) }, unavailable).await;

        assert_eq!(res.unwrap(), "SIGINT");
    }

    #[tokio::test]
    async fn terminate_is_heard_while_interrupt_is_pending() {
        let interrupt = future::pending::<io::Result<()>>();
        let res = first_signal(interrupt, Ok::<_, io::Error>(async {})).await;

        assert_eq!(res.unwrap(), "SIGTERM");
    }

    struct SlowConsumer;

    #[async_trait]
    impl Stoppable for SlowConsumer {
        async fn stop(&self) -> Result<ConsumerStats, AmqpError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(stats())
        }
    }

    #[tokio::test]
    async fn observers_see_every_state() {
        let coordinator = ShutdownCoordinator::new(CancellationToken::new());
        let mut rx = coordinator.subscribe();
        let mut seen = vec![*rx.borrow()];
        let observer = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                seen.push(state);
                if state == ShutdownState::Closed {
                    break;
                }
            }
            seen
        });

        let mut connection = MockClosable::new();
        connection.expect_close().returning(|| Ok(()));

        coordinator.shutdown();
        let res = coordinator.run_until_shutdown(&SlowConsumer, &connection).await;
        assert_eq!(res, Ok(stats()));

        assert_eq!(
            observer.await.unwrap(),
            vec![
                ShutdownState::Running,
                ShutdownState::ShutdownRequested,
                ShutdownState::Draining,
                ShutdownState::Closed,
            ]
        );
    }
}
