//! HTTP to HTTPS redirect listener.
//!
//! A lightweight plaintext server (port 80 by default) that answers every
//! request with a permanent redirect to the same host and path over HTTPS.

use std::net::SocketAddr;

use axum::http::Uri;
use axum::response::Redirect;
use axum::routing::any;
use axum::Router;
use axum_extra::extract::Host;
use tokio::task::JoinHandle;

use super::server::ServerError;

/// Spawn the redirect listener on `http_port`, pointing clients at `https_port`.
///
/// The task only finishes on failure; its result is surfaced by the launcher
/// as a fatal error.
pub fn spawn_redirect_server(http_port: u16, https_port: u16) -> JoinHandle<Result<(), ServerError>> {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], http_port));

        tracing::info!(
            http_port = %http_port,
            https_port = %https_port,
            "Starting HTTP->HTTPS redirect server"
        );

        let app = Router::new().fallback(any(move |Host(host): Host, uri: Uri| async move {
            redirect_to_https(&host, &uri, https_port)
        }));

        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .map_err(ServerError::Redirect)
    })
}

/// Strip any port from a `Host` header value, keeping IPv6 brackets.
fn host_name(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Build the HTTPS location for a plaintext request.
fn https_location(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = host_name(host);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    }
}

fn redirect_to_https(host: &str, uri: &Uri, https_port: u16) -> Redirect {
    let location = https_location(host, uri, https_port);
    tracing::debug!(from = %uri, to = %location, "Redirecting HTTP to HTTPS");
    Redirect::permanent(&location)
}
