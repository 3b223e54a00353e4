//! HTTPS server launch logic.
//!
//! Supports three credential sources:
//! - Static: certificate and key files (development preset)
//! - ACME: automatic Let's Encrypt certificates (production preset)
//! - Plain: no TLS
//!
//! Every launch binds the listener, spawns one [`ShutdownCoordinator`] and then
//! blocks serving until the coordinator has drained the server or a fatal
//! error occurs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum_server::accept::DefaultAcceptor;
use axum_server::tls_rustls::RustlsAcceptor;
use axum_server::{Handle, Server};
use const_format::formatcp;
use hyper_util::rt::TokioTimer;
use rustls_acme::axum::AxumAcceptor;

use super::conn::TimeoutAcceptor;
use super::redirect;
use super::shutdown::ShutdownCoordinator;
use super::signal::{OsSignals, TerminationSource};
use super::tls::{self, AcmeSettings};

/// Standard HTTPS port
pub const HTTPS_PORT: u16 = 443;

/// Standard HTTP port, used by the redirect listener
pub const HTTP_PORT: u16 = 80;

/// Production listen address (all interfaces, standard HTTPS port)
pub const PRODUCTION_ADDR: &str = formatcp!("0.0.0.0:{}", HTTPS_PORT);

/// Default ACME certificate cache directory
pub const DEFAULT_ACME_CACHE_DIR: &str = "certs";

/// Drain budget for development and plain servers
pub const DEV_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Drain budget for production servers
pub const PROD_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Server startup or runtime error. All of these are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to resolve listen address '{addr}': {reason}")]
    Resolve { addr: String, reason: String },

    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Failed to install signal handlers: {0}")]
    Signals(std::io::Error),

    #[error("Server error: {0}")]
    Serve(std::io::Error),

    #[error("HTTP redirect server failed: {0}")]
    Redirect(std::io::Error),
}

impl ServerError {
    /// True if the server never started serving.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ServerError::Resolve { .. }
                | ServerError::Bind(_)
                | ServerError::TlsConfig(_)
                | ServerError::Signals(_)
        )
    }
}

/// Connection timeouts.
///
/// None of these cancel a handler that is still computing its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Time allowed to receive request headers (HTTP/1).
    pub read: Duration,
    /// Longest a response write may make no progress before the connection
    /// is dropped.
    pub write: Duration,
    /// Connections with no request in flight and no traffic for this long
    /// are closed. `None` keeps them open.
    pub idle: Option<Duration>,
}

/// Where TLS credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    /// Plain HTTP, no TLS.
    Plain,
    /// PEM files read at startup (and on SIGHUP).
    Static { cert_path: PathBuf, key_path: PathBuf },
    /// Certificates fetched per handshake from the ACME provider.
    Acme(AcmeSettings),
}

/// Everything needed to launch one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address, `host:port`. Host names are resolved at launch.
    pub addr: String,
    pub timeouts: Timeouts,
    pub tls: TlsSource,
    /// Maximum time to wait for in-flight requests on shutdown.
    pub drain_timeout: Duration,
    /// Port for the HTTP->HTTPS redirect listener, if any.
    pub redirect_port: Option<u16>,
}

impl ServerConfig {
    /// Development preset: static certificate files, 5s timeouts, 30s drain.
    pub fn development(
        addr: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            addr: addr.into(),
            timeouts: Timeouts {
                read: Duration::from_secs(5),
                write: Duration::from_secs(5),
                idle: None,
            },
            tls: TlsSource::Static {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            },
            drain_timeout: DEV_DRAIN_TIMEOUT,
            redirect_port: None,
        }
    }

    /// Production preset: ACME certificates for `hosts`, redirect from port 80,
    /// 60s drain.
    pub fn production<I, H>(hosts: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<String>,
    {
        Self {
            addr: PRODUCTION_ADDR.to_string(),
            timeouts: Timeouts {
                read: Duration::from_secs(5),
                write: Duration::from_secs(10),
                idle: Some(Duration::from_secs(120)),
            },
            tls: TlsSource::Acme(AcmeSettings {
                domains: hosts.into_iter().map(Into::into).collect(),
                cache_dir: PathBuf::from(DEFAULT_ACME_CACHE_DIR),
                contact_email: None,
                production: true,
            }),
            drain_timeout: PROD_DRAIN_TIMEOUT,
            redirect_port: Some(HTTP_PORT),
        }
    }

    /// Plain HTTP preset, for running behind a TLS-terminating proxy.
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeouts: Timeouts {
                read: Duration::from_secs(5),
                write: Duration::from_secs(5),
                idle: None,
            },
            tls: TlsSource::Plain,
            drain_timeout: DEV_DRAIN_TIMEOUT,
            redirect_port: None,
        }
    }
}

/// Start a development server with certificate files and OS signal handling.
///
/// Blocks until the server has shut down.
pub async fn start_dev(
    app: Router,
    addr: impl Into<String>,
    cert_path: impl Into<PathBuf>,
    key_path: impl Into<PathBuf>,
) -> Result<(), ServerError> {
    Launcher::new(app, ServerConfig::development(addr, cert_path, key_path))
        .serve()
        .await
}

/// Start a production server with ACME certificates for `hosts`.
///
/// Blocks until the server has shut down.
pub async fn start_prod<I, H>(app: Router, hosts: I) -> Result<(), ServerError>
where
    I: IntoIterator<Item = H>,
    H: Into<String>,
{
    Launcher::new(app, ServerConfig::production(hosts))
        .serve()
        .await
}

/// A configured server that has not started yet.
pub struct Launcher {
    app: Router,
    config: ServerConfig,
    handle: Handle,
}

/// Listener with its TLS acceptor attached.
enum Bound {
    Plain(Server<TimeoutAcceptor<DefaultAcceptor>>),
    Static(Server<TimeoutAcceptor<RustlsAcceptor>>),
    Acme(Server<TimeoutAcceptor<AxumAcceptor>>),
}

impl Launcher {
    pub fn new(app: Router, config: ServerConfig) -> Self {
        Self {
            app,
            config,
            handle: Handle::new(),
        }
    }

    /// Handle to the server, e.g. to learn the bound address with
    /// [`Handle::listening`].
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serve until SIGINT or SIGTERM, then drain.
    pub async fn serve(self) -> Result<(), ServerError> {
        let signals = OsSignals::install().map_err(ServerError::Signals)?;
        self.serve_until(signals).await
    }

    /// Serve until `source` reports termination, then drain.
    pub async fn serve_until<S: TerminationSource>(self, source: S) -> Result<(), ServerError> {
        tls::install_crypto_provider();

        let Self {
            app,
            config,
            handle,
        } = self;

        let addr = resolve(&config.addr).await?;
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let mut reload = None;
        let bound = match &config.tls {
            TlsSource::Plain => {
                tracing::warn!(
                    "TLS disabled - server running on plain HTTP (not recommended for production)"
                );
                tracing::info!("Running plain HTTP server on: http://{}", local_addr);
                Bound::Plain(axum_server::from_tcp(listener).acceptor(TimeoutAcceptor::new(
                    DefaultAcceptor::new(),
                    config.timeouts,
                )))
            }
            TlsSource::Static {
                cert_path,
                key_path,
            } => {
                let rustls_config = tls::load_static(cert_path, key_path).await?;
                reload = Some(tls::spawn_reload_handler(
                    rustls_config.clone(),
                    cert_path.clone(),
                    key_path.clone(),
                )?);
                tracing::info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    "Running development server on: https://{}",
                    local_addr
                );
                Bound::Static(axum_server::from_tcp(listener).acceptor(TimeoutAcceptor::new(
                    RustlsAcceptor::new(rustls_config),
                    config.timeouts,
                )))
            }
            TlsSource::Acme(settings) => {
                let acceptor = tls::acme_acceptor(settings)?;
                tracing::info!(
                    %local_addr,
                    domains = ?settings.domains,
                    "Running production server..."
                );
                Bound::Acme(
                    axum_server::from_tcp(listener)
                        .acceptor(TimeoutAcceptor::new(acceptor, config.timeouts)),
                )
            }
        };

        let coordinator =
            ShutdownCoordinator::new(source, handle.clone(), config.drain_timeout).spawn();

        let redirect = config
            .redirect_port
            .map(|port| redirect::spawn_redirect_server(port, local_addr.port()));

        let serving = serve_bound(bound, app, &config.timeouts, handle);

        let result = match redirect {
            Some(mut redirect) => {
                tokio::select! {
                    result = serving => {
                        redirect.abort();
                        result
                    }
                    finished = &mut redirect => Err(redirect_failure(finished)),
                }
            }
            None => serving.await,
        };

        if let Some(reload) = reload {
            reload.abort();
        }

        match result {
            Ok(()) => {
                // Serving only ends cleanly after the coordinator requested it;
                // wait so the drain outcome is logged first.
                if let Err(e) = coordinator.await {
                    tracing::error!(error = %e, "Shutdown coordinator task failed");
                }
                Ok(())
            }
            Err(e) => {
                coordinator.abort();
                Err(e)
            }
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ServerError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ServerError::Resolve {
        addr: addr.to_string(),
        reason: "no addresses found".to_string(),
    })
}

// Write and idle timeouts live in `TimeoutAcceptor`.
fn apply_timeouts<A>(server: &mut Server<A>, timeouts: &Timeouts) {
    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read);
}

async fn serve_bound(
    bound: Bound,
    app: Router,
    timeouts: &Timeouts,
    handle: Handle,
) -> Result<(), ServerError> {
    let result = match bound {
        Bound::Plain(mut server) => {
            apply_timeouts(&mut server, timeouts);
            server.handle(handle).serve(app.into_make_service()).await
        }
        Bound::Static(mut server) => {
            apply_timeouts(&mut server, timeouts);
            server.handle(handle).serve(app.into_make_service()).await
        }
        Bound::Acme(mut server) => {
            apply_timeouts(&mut server, timeouts);
            server.handle(handle).serve(app.into_make_service()).await
        }
    };
    result.map_err(ServerError::Serve)
}

fn redirect_failure(
    finished: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> ServerError {
    match finished {
        Ok(Err(e)) => e,
        Ok(Ok(())) => ServerError::Redirect(std::io::Error::other("redirect listener exited")),
        Err(e) => ServerError::Redirect(std::io::Error::other(e.to_string())),
    }
}
