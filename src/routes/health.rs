//! Liveness endpoint.
//!
//! Answers 200 for as long as the listener accepts connections. Once a drain
//! starts the listener is closed, so load balancers see the instance go away
//! without a separate readiness flag.

pub async fn health() -> &'static str {
    "ok"
}
