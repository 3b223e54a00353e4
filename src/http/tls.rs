//! TLS credential sources.
//!
//! - Static: PEM certificate and key files, reloadable on SIGHUP
//! - ACME: certificates issued and renewed on demand by Let's Encrypt

use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;
use futures::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::axum::AxumAcceptor;
use rustls_acme::AcmeConfig;

use super::server::ServerError;

/// Settings for the ACME certificate provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    /// Host names certificates may be issued for. Handshakes for any other
    /// name are refused.
    pub domains: Vec<String>,
    /// Directory where account keys and certificates are cached.
    pub cache_dir: PathBuf,
    /// Optional contact address registered with the CA.
    pub contact_email: Option<String>,
    /// Use the Let's Encrypt production directory instead of staging.
    pub production: bool,
}

/// Make sure rustls has a process-wide crypto provider.
///
/// Both axum-server and rustls-acme pull in rustls; with more than one
/// provider compiled in, rustls refuses to pick one on its own.
pub fn install_crypto_provider() {
    // Err means a provider is already installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Load a static certificate/key pair.
pub async fn load_static(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, ServerError> {
    RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| {
            ServerError::TlsConfig(format!(
                "Failed to load certificates from '{}' and '{}': {}",
                cert_path.display(),
                key_path.display(),
                e
            ))
        })
}

/// Build an acceptor that obtains certificates from the ACME directory.
///
/// Also spawns the task that drives issuance and renewal. Domain validation
/// uses the TLS-ALPN-01 challenge, answered by the returned acceptor itself.
pub fn acme_acceptor(settings: &AcmeSettings) -> Result<AxumAcceptor, ServerError> {
    let env_name = if settings.production { "production" } else { "staging" };
    tracing::info!(
        domains = ?settings.domains,
        cache = %settings.cache_dir.display(),
        environment = %env_name,
        "Configuring ACME certificates"
    );

    if !settings.production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
             Set acme_production = true for production use."
        );
    }

    std::fs::create_dir_all(&settings.cache_dir).map_err(|e| {
        ServerError::TlsConfig(format!(
            "Failed to create ACME cache directory '{}': {}",
            settings.cache_dir.display(),
            e
        ))
    })?;

    // rustls-acme agrees to the CA's terms of service when creating the account.
    let mut config = AcmeConfig::new(settings.domains.clone())
        .cache(DirCache::new(settings.cache_dir.clone()))
        .directory_lets_encrypt(settings.production);
    if let Some(email) = &settings.contact_email {
        config = config.contact_push(format!("mailto:{}", email));
    }

    let mut state = config.state();
    let acceptor = state.axum_acceptor(state.default_rustls_config());

    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => {
                    tracing::info!(event = ?event, "ACME event");
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "ACME error");
                }
                None => {
                    tracing::debug!("ACME state stream ended");
                    break;
                }
            }
        }
    });

    Ok(acceptor)
}

/// Reload static certificates from disk whenever SIGHUP arrives.
#[cfg(unix)]
pub fn spawn_reload_handler(
    tls_config: RustlsConfig,
    cert_path: PathBuf,
    key_path: PathBuf,
) -> Result<tokio::task::JoinHandle<()>, ServerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).map_err(ServerError::Signals)?;

    Ok(tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match tls_config.reload_from_pem_file(&cert_path, &key_path).await {
                Ok(()) => {
                    tracing::info!(
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "TLS certificates reloaded"
                    );
                }
                Err(e) => {
                    // The previous certificates stay in use.
                    tracing::error!(
                        error = %e,
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_reload_handler(
    _tls_config: RustlsConfig,
    _cert_path: PathBuf,
    _key_path: PathBuf,
) -> Result<tokio::task::JoinHandle<()>, ServerError> {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
    Ok(tokio::spawn(async {}))
}
