//! Drawbridge - an HTTPS launcher with graceful shutdown
//!
//! Serves an axum [`Router`](axum::Router) over TLS using either certificate
//! files (development) or automatic Let's Encrypt certificates with an HTTP to
//! HTTPS redirect (production). SIGTERM/SIGINT drain in-flight requests within
//! a fixed budget before the server stops.

pub mod config;
pub mod http;
pub mod middleware;
pub mod routes;

pub use crate::http::{start_dev, start_prod, Launcher, ServeOutcome, ServerConfig, ServerError};
