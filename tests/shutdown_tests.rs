//! Graceful shutdown against a real server.
//!
//! These tests bind servers on ephemeral loopback ports and stop them with a
//! manual termination trigger instead of process signals.
//!
//! Run with: cargo test --test shutdown_tests
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use axum_server::Handle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::subscriber::DefaultGuard;

use drawbridge::http::{manual, DrainError, ShutdownCoordinator, ShutdownPhase};
use drawbridge::{Launcher, ServeOutcome, ServerConfig, ServerError};

/// Router with `/health` and a `/slow` route that signals `started` and then
/// sleeps for `delay` before answering.
fn slow_app(delay: Duration, started: Arc<Notify>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/slow",
            get(move || {
                let started = started.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(delay).await;
                    "done"
                }
            }),
        )
}

/// Client without connection reuse, so every request opens a new connection.
fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// Log output of the current thread, for asserting on what was logged and in
/// which order. Tests using it must run on a current-thread runtime.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn install(&self) -> DefaultGuard {
        let logs = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .without_time()
            .with_writer(move || logs.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Index of the first line containing `needle`.
    fn line_of(&self, needle: &str) -> usize {
        let text = self.text();
        text.lines()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no log line contains {:?}:\n{}", needle, text))
    }
}

fn plain_config(drain: Duration) -> ServerConfig {
    let mut config = ServerConfig::plain("127.0.0.1:0");
    config.drain_timeout = drain;
    config
}

/// Serve `app` on a loopback port with `handle`, returning the bound address.
async fn spawn_server(app: Router, handle: Handle) -> SocketAddr {
    let server_handle = handle.clone();
    tokio::spawn(async move {
        axum_server::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
    });
    handle.listening().await.expect("server failed to start")
}

#[tokio::test]
async fn test_request_finishing_within_budget_completes() {
    let started = Arc::new(Notify::new());
    let handle = Handle::new();
    let addr = spawn_server(
        slow_app(Duration::from_millis(200), started.clone()),
        handle.clone(),
    )
    .await;

    let (trigger, source) = manual();
    let coordinator = ShutdownCoordinator::new(source, handle, Duration::from_secs(5)).spawn();

    let request = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
    started.notified().await;
    assert!(trigger.trigger());

    assert_eq!(coordinator.await.unwrap(), Ok(()));

    let response = request.await.unwrap().expect("request was cut off");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn test_request_outliving_budget_is_cut_off() {
    let started = Arc::new(Notify::new());
    let handle = Handle::new();
    let addr = spawn_server(
        slow_app(Duration::from_secs(30), started.clone()),
        handle.clone(),
    )
    .await;

    let (trigger, source) = manual();
    let budget = Duration::from_millis(300);
    let coordinator = ShutdownCoordinator::new(source, handle, budget).spawn();

    let request = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
    started.notified().await;
    let signaled_at = tokio::time::Instant::now();
    assert!(trigger.trigger());

    let result = coordinator.await.unwrap();
    assert!(
        matches!(result, Err(DrainError::DeadlineExceeded { .. })),
        "unexpected drain result: {:?}",
        result
    );
    assert!(signaled_at.elapsed() >= budget);

    let response = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("request still running after the deadline")
        .unwrap();
    assert!(response.is_err(), "request finished instead of being cut off");
}

#[tokio::test]
async fn test_server_keeps_serving_until_signaled() {
    let handle = Handle::new();
    let addr = spawn_server(
        slow_app(Duration::ZERO, Arc::new(Notify::new())),
        handle.clone(),
    )
    .await;

    let (_trigger, source) = manual();
    let coordinator = ShutdownCoordinator::new(source, handle, Duration::from_secs(5));
    let phase = coordinator.subscribe();
    let task = coordinator.spawn();

    for _ in 0..3 {
        let response = client()
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(*phase.borrow(), ShutdownPhase::Armed);
    assert!(!task.is_finished());
    task.abort();
}

#[tokio::test]
async fn test_launcher_clean_shutdown() {
    let launcher = Launcher::new(
        slow_app(Duration::ZERO, Arc::new(Notify::new())),
        plain_config(Duration::from_secs(30)),
    );
    let handle = launcher.handle();
    let (trigger, source) = manual();
    let server = tokio::spawn(launcher.serve_until(source));

    let addr = handle.listening().await.expect("server failed to start");
    let response = client()
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "ok");

    assert!(trigger.trigger());
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();

    let outcome = ServeOutcome::from(result);
    assert!(outcome.is_clean());
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_launcher_refuses_new_connections_while_draining() {
    let started = Arc::new(Notify::new());
    let launcher = Launcher::new(
        slow_app(Duration::from_millis(500), started.clone()),
        plain_config(Duration::from_secs(5)),
    );
    let handle = launcher.handle();
    let (trigger, source) = manual();
    let server = tokio::spawn(launcher.serve_until(source));
    let addr = handle.listening().await.expect("server failed to start");

    let in_flight = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
    started.notified().await;
    assert!(trigger.trigger());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let late = client()
        .get(format!("http://{}/health", addr))
        .timeout(Duration::from_secs(1))
        .send()
        .await;
    assert!(late.is_err(), "new connection accepted during drain");

    let response = in_flight.await.unwrap().expect("in-flight request was cut off");
    assert_eq!(response.status(), 200);

    let result = server.await.unwrap();
    assert!(result.is_ok(), "unexpected launcher result: {:?}", result);
}

#[tokio::test]
async fn test_launcher_reports_bind_conflict() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let mut config = ServerConfig::plain(addr.to_string());
    config.drain_timeout = Duration::from_secs(1);
    let (_trigger, source) = manual();

    let result = Launcher::new(Router::new(), config).serve_until(source).await;
    assert!(matches!(result, Err(ServerError::Bind(_))));

    let outcome = ServeOutcome::from(result);
    assert!(matches!(outcome, ServeOutcome::BindError(_)));
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_slow_handler_is_bounded_by_drain_not_write_timeout() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    let started = Arc::new(Notify::new());
    let mut config = plain_config(Duration::from_secs(2));
    config.timeouts.write = Duration::from_secs(1);
    let launcher = Launcher::new(slow_app(Duration::from_secs(30), started.clone()), config);
    let handle = launcher.handle();
    let (trigger, source) = manual();
    let server = tokio::spawn(launcher.serve_until(source));
    let addr = handle.listening().await.expect("server failed to start");

    let request = tokio::spawn(client().get(format!("http://{}/slow", addr)).send());
    started.notified().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let signaled_at = tokio::time::Instant::now();
    assert!(trigger.trigger());

    // The handler outlives the write timeout and keeps running until the
    // drain deadline force-closes its connection.
    let response = tokio::time::timeout(Duration::from_secs(10), request)
        .await
        .expect("request still running after the deadline")
        .unwrap();
    assert!(
        response.is_err(),
        "request answered instead of being cut off: {:?}",
        response.map(|r| r.status())
    );
    assert!(signaled_at.elapsed() >= Duration::from_secs(2));

    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok(), "unexpected launcher result: {:?}", result);

    let shutting_down = logs.line_of("Server shutting down, timeout: 2s");
    let exceeded = logs.line_of("graceful shutdown deadline exceeded");
    assert!(shutting_down < exceeded);
    assert!(!logs.text().contains("Server stopped"));
}

#[tokio::test]
async fn test_idle_keep_alive_connection_is_closed() {
    let mut config = plain_config(Duration::from_secs(5));
    config.timeouts.idle = Some(Duration::from_secs(1));
    let launcher = Launcher::new(slow_app(Duration::ZERO, Arc::new(Notify::new())), config);
    let handle = launcher.handle();
    let (trigger, source) = manual();
    let server = tokio::spawn(launcher.serve_until(source));
    let addr = handle.listening().await.expect("server failed to start");

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.ends_with(b"ok") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the response");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received.starts_with(b"HTTP/1.1 200"));
    let answered_at = tokio::time::Instant::now();

    // Keep-alive connection with nothing in flight: closed by the server.
    let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("idle connection left open")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(answered_at.elapsed() >= Duration::from_millis(900));

    assert!(trigger.trigger());
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_launcher_reports_redirect_port_conflict() {
    // The redirect listener binds all interfaces.
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let mut config = plain_config(Duration::from_secs(1));
    config.redirect_port = Some(occupied.local_addr().unwrap().port());
    let (_trigger, source) = manual();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Launcher::new(Router::new(), config).serve_until(source),
    )
    .await
    .expect("launcher kept serving without its redirect listener");
    assert!(matches!(result, Err(ServerError::Redirect(_))));

    let outcome = ServeOutcome::from(result);
    assert!(matches!(outcome, ServeOutcome::TransportError(_)));
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_development_launcher_serves_https_and_logs_lifecycle() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();

    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let launcher = Launcher::new(
        slow_app(Duration::ZERO, Arc::new(Notify::new())),
        ServerConfig::development("127.0.0.1:0", &cert_path, &key_path),
    );
    let handle = launcher.handle();
    let (trigger, source) = manual();
    let server = tokio::spawn(launcher.serve_until(source));
    let addr = handle.listening().await.expect("server failed to start");

    let tls_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let response = tls_client
        .get(format!("https://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    assert!(trigger.trigger());
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(ServeOutcome::from(result).is_clean());

    let banner = logs.line_of(&format!("Running development server on: https://{}", addr));
    let shutting_down = logs.line_of("Server shutting down, timeout: 30s");
    let stopped = logs.line_of("Server stopped");
    assert!(banner < shutting_down);
    assert!(shutting_down < stopped);
}

#[tokio::test]
async fn test_launcher_reports_missing_certificates() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::development(
        "127.0.0.1:0",
        dir.path().join("cert.pem"),
        dir.path().join("key.pem"),
    );
    let (_trigger, source) = manual();

    let result = Launcher::new(Router::new(), config).serve_until(source).await;
    assert!(matches!(result, Err(ServerError::TlsConfig(_))));
    assert!(!ServeOutcome::from(result).is_clean());
}
