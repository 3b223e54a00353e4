//! Graceful shutdown coordination.
//!
//! A [`ShutdownCoordinator`] sits between a [`TerminationSource`] and a running
//! server. It waits, without polling or timing out, for the first termination
//! notification, then asks the server to drain within a fixed budget:
//!
//! 1. Stop accepting new connections
//! 2. Let in-flight requests finish
//! 3. Force-close whatever is still open when the deadline passes
//!
//! The outcome is logged and never escalated. There is exactly one drain
//! attempt per coordinator.

use std::time::Duration;

use async_trait::async_trait;
use axum_server::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::signal::TerminationSource;

/// How often a draining [`Handle`] is checked for remaining connections.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure of a bounded drain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DrainError {
    #[error("graceful shutdown deadline exceeded with {open_connections} connection(s) still open")]
    DeadlineExceeded { open_connections: usize },

    #[error("{0}")]
    Transport(String),
}

/// A server that can be asked to stop accepting work and wait for in-flight
/// work to finish, up to a deadline.
#[async_trait]
pub trait Drain: Send + Sync + 'static {
    async fn drain(&self, deadline: Instant) -> Result<(), DrainError>;
}

#[async_trait]
impl Drain for Handle {
    async fn drain(&self, deadline: Instant) -> Result<(), DrainError> {
        // axum-server force-closes remaining connections once the grace period ends.
        let grace = deadline.saturating_duration_since(Instant::now());
        self.graceful_shutdown(Some(grace));

        let settled = async {
            while self.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout_at(deadline, settled).await {
            // Connections that only closed at the deadline were cut off.
            Ok(()) if Instant::now() < deadline => Ok(()),
            _ => Err(DrainError::DeadlineExceeded {
                open_connections: self.connection_count(),
            }),
        }
    }
}

/// Where a coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Waiting for a termination notification; the server is serving.
    Armed,
    /// A drain is in progress.
    Draining,
    /// The drain returned, successfully or not.
    Stopped,
}

/// Bridges one termination notification into one bounded drain.
pub struct ShutdownCoordinator<S, D> {
    source: S,
    server: D,
    max_drain: Duration,
    phase: watch::Sender<ShutdownPhase>,
}

impl<S, D> ShutdownCoordinator<S, D>
where
    S: TerminationSource,
    D: Drain,
{
    pub fn new(source: S, server: D, max_drain: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Armed);
        Self {
            source,
            server,
            max_drain,
            phase,
        }
    }

    /// The configured drain budget.
    pub fn max_drain(&self) -> Duration {
        self.max_drain
    }

    /// Observe phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Wait for termination, drain, and report the drain result.
    pub async fn run(mut self) -> Result<(), DrainError> {
        let termination = self.source.recv().await;

        let deadline = Instant::now() + self.max_drain;
        self.phase.send_replace(ShutdownPhase::Draining);
        tracing::info!(
            signal = %termination,
            "Server shutting down, timeout: {:?}",
            self.max_drain
        );

        let result = self.server.drain(deadline).await;
        self.phase.send_replace(ShutdownPhase::Stopped);

        match &result {
            Ok(()) => tracing::info!("Server stopped"),
            Err(e) => tracing::error!("Error: {}", e),
        }

        result
    }

    /// Run the coordinator on its own task.
    pub fn spawn(self) -> JoinHandle<Result<(), DrainError>> {
        tokio::spawn(self.run())
    }
}
