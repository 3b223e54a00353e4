//! HTTPS server with graceful shutdown.
//!
//! - **Development**: certificate and key files, reloaded on SIGHUP
//! - **Production**: automatic Let's Encrypt certificates plus an HTTP to
//!   HTTPS redirect listener
//! - **Plain**: no TLS, for use behind a reverse proxy
//!
//! In every mode SIGTERM/SIGINT stops accepting connections and drains
//! in-flight requests within a fixed budget.

mod conn;
mod outcome;
mod redirect;
mod server;
pub mod shutdown;
pub mod signal;
mod tls;

pub use outcome::ServeOutcome;
pub use server::{
    start_dev, start_prod, Launcher, ServerConfig, ServerError, Timeouts, TlsSource,
    DEFAULT_ACME_CACHE_DIR, DEV_DRAIN_TIMEOUT, HTTPS_PORT, HTTP_PORT, PROD_DRAIN_TIMEOUT,
};
pub use shutdown::{Drain, DrainError, ShutdownCoordinator, ShutdownPhase};
pub use signal::{manual, OsSignals, Termination, TerminationHandle, TerminationSource};
pub use tls::AcmeSettings;
