//! Termination signal sources.
//!
//! The shutdown coordinator does not talk to the OS directly. It waits on a
//! [`TerminationSource`], which is either the real process signals
//! ([`OsSignals`]) or an in-process trigger ([`manual`]) used by tests and by
//! embedders that want to stop the server from code.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// What asked the server to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// A [`TerminationHandle`] was triggered
    Requested,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupt => f.write_str("SIGINT"),
            Termination::Terminate => f.write_str("SIGTERM"),
            Termination::Requested => f.write_str("requested"),
        }
    }
}

/// A source of termination notifications.
///
/// `recv` resolves once, the first time a termination request is observed.
/// Implementations must not resolve spuriously: a source that can no longer
/// produce a notification stays pending forever.
#[async_trait]
pub trait TerminationSource: Send + 'static {
    async fn recv(&mut self) -> Termination;
}

/// Process signal subscription (SIGINT and SIGTERM on unix, Ctrl+C elsewhere).
///
/// Handlers are registered by [`OsSignals::install`] and stay registered for as
/// long as the value is alive.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Register interest in interrupt and terminate signals.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
#[async_trait]
impl TerminationSource for OsSignals {
    async fn recv(&mut self) -> Termination {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Termination::Interrupt,
            Some(()) = self.terminate.recv() => Termination::Terminate,
            else => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
#[async_trait]
impl TerminationSource for OsSignals {
    async fn recv(&mut self) -> Termination {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Termination::Interrupt,
            Err(e) => {
                tracing::error!(error = %e, "Ctrl+C listener failed, shutdown only by process exit");
                std::future::pending().await
            }
        }
    }
}

/// Create a linked trigger/source pair.
pub fn manual() -> (TerminationHandle, ManualSource) {
    let (tx, rx) = mpsc::channel(1);
    (TerminationHandle { tx }, ManualSource { rx })
}

/// Requests termination of the server watching the paired [`ManualSource`].
#[derive(Clone, Debug)]
pub struct TerminationHandle {
    tx: mpsc::Sender<()>,
}

impl TerminationHandle {
    /// Request termination.
    ///
    /// Returns `true` if this call delivered the request, `false` if a request
    /// is already pending or the source has already consumed one.
    pub fn trigger(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Termination source fed by [`TerminationHandle::trigger`].
#[derive(Debug)]
pub struct ManualSource {
    rx: mpsc::Receiver<()>,
}

#[async_trait]
impl TerminationSource for ManualSource {
    async fn recv(&mut self) -> Termination {
        match self.rx.recv().await {
            Some(()) => {
                // Later triggers are rejected rather than queued.
                self.rx.close();
                Termination::Requested
            }
            None => std::future::pending().await,
        }
    }
}
