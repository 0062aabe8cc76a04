//! Deadline-aware byte stream.
//!
//! [`TimedIo`] wraps one half of a peer stream so that every I/O operation
//! runs under a fresh deadline, armed before the underlying poll and kept
//! armed across `Pending` polls until the operation completes. A deadline
//! that fires surfaces as `io::ErrorKind::TimedOut`, which the harness
//! treats like any other transient fault. Whenever at least one byte moves,
//! a shared [`Stamp`] is refreshed so the connection can report its last
//! read and write times.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

// ── Stamp ────────────────────────────────────────────────────────

/// Shared last-activity timestamp, one per direction per connection.
#[derive(Debug, Clone)]
pub struct Stamp(Arc<Mutex<Instant>>);

impl Stamp {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn get(&self) -> Instant {
        *self.0.lock().expect("stamp lock")
    }

    fn touch(&self) {
        *self.0.lock().expect("stamp lock") = Instant::now();
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Self::new()
    }
}

// ── TimedIo ──────────────────────────────────────────────────────

/// A read or write half with per-operation deadlines and activity stamps.
///
/// A zero `timeout` disables the deadline entirely.
pub struct TimedIo<T> {
    inner: T,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    stamp: Stamp,
}

impl<T> TimedIo<T> {
    pub fn new(inner: T, timeout: Duration, stamp: Stamp) -> Self {
        Self {
            inner,
            timeout: (timeout > Duration::ZERO).then_some(timeout),
            deadline: None,
            stamp,
        }
    }

    /// Arms the deadline if not already armed, then polls it. `Err` means
    /// the deadline fired before the current operation completed.
    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Result<(), io::Error> {
        let Some(timeout) = self.timeout else {
            return Ok(());
        };
        let deadline = self
            .deadline
            .get_or_insert_with(|| Box::pin(sleep(timeout)));
        if deadline.as_mut().poll(cx).is_ready() {
            self.deadline = None;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "i/o deadline elapsed",
            ));
        }
        Ok(())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TimedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.poll_deadline(cx) {
            return Poll::Ready(Err(e));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.deadline = None;
                if res.is_ok() && buf.filled().len() > before {
                    this.stamp.touch();
                }
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.poll_deadline(cx) {
            return Poll::Ready(Err(e));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.deadline = None;
                if matches!(res, Ok(n) if n > 0) {
                    this.stamp.touch();
                }
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
