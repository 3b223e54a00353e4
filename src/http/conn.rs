//! Per-connection write and idle timeouts.
//!
//! [`TimeoutAcceptor`] wraps any axum-server acceptor. Each accepted
//! connection gets a [`TimedStream`] and a [`TrackedService`] sharing one
//! activity record:
//!
//! - A write (or flush) that makes no progress for the write timeout fails
//!   with `TimedOut`, which closes the connection.
//! - A connection with no request in flight and no traffic for the idle
//!   timeout reads as end-of-stream, so hyper closes it between requests.
//!
//! Neither timer touches a running handler. A request that is still being
//! computed keeps its connection open, and only the shutdown drain deadline
//! bounds it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum_server::accept::Accept;
use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};
use tower::Service;

use super::server::Timeouts;

/// Traffic and in-flight requests of one connection.
struct Activity {
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
    reader: AtomicWaker,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
            reader: AtomicWaker::new(),
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Marks one request as in flight until dropped.
struct InFlight(Arc<Activity>);

impl InFlight {
    fn enter(activity: Arc<Activity>) -> Self {
        activity.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(activity)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
        // A read parked while the request ran has to arm the idle timer now.
        self.0.reader.wake();
    }
}

/// Acceptor applying [`Timeouts::write`] and [`Timeouts::idle`] to every
/// connection accepted by `inner`.
#[derive(Debug, Clone)]
pub struct TimeoutAcceptor<A> {
    inner: A,
    timeouts: Timeouts,
}

impl<A> TimeoutAcceptor<A> {
    pub fn new(inner: A, timeouts: Timeouts) -> Self {
        Self { inner, timeouts }
    }
}

impl<A, I, S> Accept<I, S> for TimeoutAcceptor<A>
where
    A: Accept<I, S>,
    A::Future: Send + 'static,
    A::Stream: Send + 'static,
    A::Service: Send + 'static,
{
    type Stream = TimedStream<A::Stream>;
    type Service = TrackedService<A::Service>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let accepted = self.inner.accept(stream, service);
        let timeouts = self.timeouts;

        Box::pin(async move {
            let (stream, service) = accepted.await?;
            let activity = Arc::new(Activity::new());
            Ok((
                TimedStream::new(stream, &timeouts, activity.clone()),
                TrackedService {
                    inner: service,
                    activity,
                },
            ))
        })
    }
}

/// Connection service that records which requests are in flight.
#[derive(Clone)]
pub struct TrackedService<S> {
    inner: S,
    activity: Arc<Activity>,
}

impl<S, R> Service<R> for TrackedService<S>
where
    S: Service<R>,
    S::Response: 'static,
    S::Error: 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        let guard = InFlight::enter(self.activity.clone());
        let response = self.inner.call(req);
        Box::pin(async move {
            let _guard = guard;
            response.await
        })
    }
}

/// Connection stream enforcing write-stall and idle timeouts.
pub struct TimedStream<T> {
    inner: T,
    write_timeout: Duration,
    idle_timeout: Option<Duration>,
    activity: Arc<Activity>,
    stalled_since: Option<Instant>,
    write_timer: Option<Pin<Box<Sleep>>>,
    idle_timer: Option<Pin<Box<Sleep>>>,
}

impl<T> TimedStream<T> {
    fn new(inner: T, timeouts: &Timeouts, activity: Arc<Activity>) -> Self {
        Self {
            inner,
            write_timeout: timeouts.write,
            idle_timeout: timeouts.idle,
            activity,
            stalled_since: None,
            write_timer: None,
            idle_timer: None,
        }
    }

    /// Called when a write is pending. Fails once the write has been stuck
    /// for the whole write timeout.
    fn poll_write_stall(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let since = *self.stalled_since.get_or_insert_with(Instant::now);
        if poll_timer(&mut self.write_timer, since + self.write_timeout, cx).is_ready() {
            tracing::debug!("Closing connection after stalled write");
            return Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        Poll::Pending
    }

    fn wrote(&mut self) {
        self.stalled_since = None;
        self.activity.touch();
    }

    /// Called when a read is pending. Resolves once the connection has been
    /// idle, with nothing in flight, for the whole idle timeout.
    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(idle) = self.idle_timeout else {
            return Poll::Pending;
        };

        self.activity.reader.register(cx.waker());
        if self.activity.in_flight() > 0 {
            return Poll::Pending;
        }

        let deadline = self.activity.last_active() + idle;
        if poll_timer(&mut self.idle_timer, deadline, cx).is_ready() {
            tracing::debug!(?idle, "Closing idle connection");
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

fn poll_timer(
    timer: &mut Option<Pin<Box<Sleep>>>,
    deadline: Instant,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let timer = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
    if timer.deadline() != deadline {
        timer.as_mut().reset(deadline);
    }
    timer.as_mut().poll(cx)
}

impl<T: AsyncRead + Unpin> AsyncRead for TimedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.activity.touch();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            // End of stream: hyper closes the connection cleanly.
            Poll::Pending => this.poll_idle(cx).map(Ok),
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.wrote();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_write_stall(cx).map(Err),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                this.wrote();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_write_stall(cx).map(Err),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                this.stalled_since = None;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_write_stall(cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
