//! The built-in site served by the binary.
//!
//! `/health` is always present. Everything else is served from `site.root`
//! when configured, or answered with a short plain-text index.

pub mod health;

use axum::{middleware, routing::get, Router};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::SiteConfig;
use crate::middleware::request_id_layer;

const INDEX_BODY: &str = concat!("drawbridge ", env!("CARGO_PKG_VERSION"), "\n");

async fn index() -> &'static str {
    INDEX_BODY
}

/// Build the router for the configured site.
pub fn create_router(site: &SiteConfig) -> Router {
    let router = Router::new().route("/health", get(health::health));

    let router = match &site.root {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router.route("/", get(index)),
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_layer))
}
