//! How a launch ended, and what the process should do about it.

use std::process::ExitCode;

use super::server::ServerError;

/// Classified result of [`Launcher::serve`](super::Launcher::serve).
#[derive(Debug)]
pub enum ServeOutcome {
    /// The server drained after a termination request.
    CleanShutdown,
    /// The server never started serving (address, bind, TLS or signal setup).
    BindError(ServerError),
    /// Serving failed after startup, including redirect listener failures.
    TransportError(ServerError),
}

impl From<Result<(), ServerError>> for ServeOutcome {
    fn from(result: Result<(), ServerError>) -> Self {
        match result {
            Ok(()) => ServeOutcome::CleanShutdown,
            Err(e) if e.is_startup() => ServeOutcome::BindError(e),
            Err(e) => ServeOutcome::TransportError(e),
        }
    }
}

impl ServeOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ServeOutcome::CleanShutdown)
    }

    /// Process exit status: 0 after a clean shutdown, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }

    /// Log the outcome and convert it into the process exit code.
    pub fn report(self) -> ExitCode {
        match &self {
            ServeOutcome::CleanShutdown => tracing::info!("Server exited"),
            ServeOutcome::BindError(e) => tracing::error!(error = %e, "Server failed to start"),
            ServeOutcome::TransportError(e) => tracing::error!(error = %e, "Server failed"),
        }
        ExitCode::from(self.exit_code())
    }
}
