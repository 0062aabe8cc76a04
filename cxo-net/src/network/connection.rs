//! Per-peer connection harness.
//!
//! A [`Conn`] owns three cooperating background tasks: a dial task
//! (outgoing connections only) that produces live streams, and a read and
//! a write task that attach to whatever stream the dial task hands them.
//! On a transient fault the broken stream is torn down and redialed with
//! exponential backoff, and both directions reattach to the replacement.
//! Incoming connections have no dial task and terminate on any fault.
//!
//! Messages queued for send survive a redial; only the frame in flight at
//! the moment of the fault is lost.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::FrameCodec;
use crate::config::Config;
use crate::error::NetError;
use crate::network::pool::PoolShared;
use crate::network::timed::{Stamp, TimedIo};

// ── State ────────────────────────────────────────────────────────

/// The connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// A live stream is attached.
    Connected,
    /// The dial task is producing a replacement stream.
    Dialing,
    /// Terminal. Never left once entered.
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Dialing => write!(f, "Dialing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ── Stream plumbing ──────────────────────────────────────────────

/// Byte stream produced by a dial or an accept: plain TCP or TLS.
pub(crate) trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub(crate) type BoxStream = Box<dyn StreamIo>;

/// Per-stream fault coordination. Exactly one of the read and write tasks
/// drives the redial for a given stream: the side that flips `fault` first
/// wins and cancels the token; the loser, and the side that never faulted,
/// just release their halves and park for the next handoff.
struct Link {
    token: CancellationToken,
    fault: AtomicBool,
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            fault: AtomicBool::new(false),
        })
    }
}

type ReadAttach = (ReadHalf<BoxStream>, Arc<Link>);
type WriteAttach = (WriteHalf<BoxStream>, Arc<Link>);

type Reader = FramedRead<TimedIo<ReadHalf<BoxStream>>, FrameCodec>;
type Writer = FramedWrite<TimedIo<WriteHalf<BoxStream>>, FrameCodec>;

/// Receiver ends handed to the background tasks at spawn time.
pub(crate) struct Harness {
    readq_tx: mpsc::Sender<Bytes>,
    writeq_rx: mpsc::Receiver<Bytes>,
    dial_rx: Option<mpsc::Receiver<Option<NetError>>>,
    rl_rx: mpsc::Receiver<ReadAttach>,
    wl_rx: mpsc::Receiver<WriteAttach>,
}

/// Spawn the harness tasks for a freshly registered connection.
pub(crate) fn start(conn: &Conn, parts: Harness, tracker: &TaskTracker) {
    let Harness {
        readq_tx,
        writeq_rx,
        dial_rx,
        rl_rx,
        wl_rx,
    } = parts;
    tracker.spawn(conn.clone().run_read(rl_rx, readq_tx));
    tracker.spawn(conn.clone().run_write(wl_rx, writeq_rx));
    if let Some(dial_rx) = dial_rx {
        tracker.spawn(conn.clone().run_dial(dial_rx));
    }
}

// ── Conn ─────────────────────────────────────────────────────────

struct ConnInner {
    address: String,
    incoming: bool,

    state: Mutex<ConnState>,

    cfg: Arc<Config>,
    pool: Weak<PoolShared>,

    send_tx: mpsc::Sender<Bytes>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    dial_tx: Option<mpsc::Sender<Option<NetError>>>,
    rl_tx: mpsc::Sender<ReadAttach>,
    wl_tx: mpsc::Sender<WriteAttach>,

    last_read: Stamp,
    last_write: Stamp,

    value: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    closed: CancellationToken,
    close_flag: AtomicBool,
}

/// Handle to a single peer connection. Cheap to clone; every clone refers
/// to the same connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    pub(crate) fn new(
        address: String,
        incoming: bool,
        cfg: Arc<Config>,
        pool: Weak<PoolShared>,
        pool_token: &CancellationToken,
    ) -> (Conn, Harness) {
        let (send_tx, writeq_rx) = mpsc::channel(cfg.write_queue_len);
        let (readq_tx, recv_rx) = mpsc::channel(cfg.read_queue_len);
        let (rl_tx, rl_rx) = mpsc::channel(1);
        let (wl_tx, wl_rx) = mpsc::channel(1);
        let (dial_tx, dial_rx) = if incoming {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        };

        let conn = Conn {
            inner: Arc::new(ConnInner {
                address,
                incoming,
                state: Mutex::new(if incoming {
                    ConnState::Connected
                } else {
                    ConnState::Dialing
                }),
                cfg,
                pool,
                send_tx,
                recv_rx: tokio::sync::Mutex::new(recv_rx),
                dial_tx,
                rl_tx,
                wl_tx,
                last_read: Stamp::new(),
                last_write: Stamp::new(),
                value: Mutex::new(None),
                closed: pool_token.child_token(),
                close_flag: AtomicBool::new(false),
            }),
        };
        let harness = Harness {
            readq_tx,
            writeq_rx,
            dial_rx,
            rl_rx,
            wl_rx,
        };
        (conn, harness)
    }

    // ── Information ──────────────────────────────────────────────

    /// Remote address: the one passed to `dial`, or the peer address of
    /// the accepted stream.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// True if this connection was accepted by the listener.
    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    /// Current state. It can change at any moment after this returns,
    /// except `Closed`, which is terminal.
    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().expect("state lock")
    }

    /// When the last byte arrived from the peer.
    pub fn last_read(&self) -> Instant {
        self.inner.last_read.get()
    }

    /// When the last byte left for the peer.
    pub fn last_write(&self) -> Instant {
        self.inner.last_write.get()
    }

    // ── Attached value ───────────────────────────────────────────

    /// The value attached with [`Conn::set_value`], if any.
    pub fn value(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.value.lock().expect("value lock").clone()
    }

    /// Attach an arbitrary caller value. The engine never inspects it.
    pub fn set_value<V: Any + Send + Sync>(&self, value: V) {
        *self.inner.value.lock().expect("value lock") = Some(Arc::new(value));
    }

    // ── Queues ───────────────────────────────────────────────────

    /// Clonable handle onto the outbound queue.
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.inner.send_tx.clone()
    }

    /// Enqueue a payload for the peer. Blocks while the outbound queue is
    /// full; fails once the connection has closed.
    pub async fn send(&self, msg: impl Into<Bytes>) -> Result<(), NetError> {
        self.inner
            .send_tx
            .send(msg.into())
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Next payload from the peer, in arrival order. `None` once the
    /// connection has closed and the queue is drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inner.recv_rx.lock().await.recv().await
    }

    // ── Close ────────────────────────────────────────────────────

    /// Terminate the connection: deregister it, wake every parked task,
    /// and fire the close callback. Idempotent.
    pub fn close(&self) {
        if self.inner.close_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(address = %self.inner.address, "closing connection");
        *self.inner.state.lock().expect("state lock") = ConnState::Closed;
        self.inner.closed.cancel();
        if let Some(pool) = self.inner.pool.upgrade() {
            pool.remove(&self.inner.address);
            if let Some(callback) = self.inner.cfg.on_close_connection.clone() {
                let conn = self.clone();
                pool.tracker.spawn(async move { callback(conn) });
            }
        }
    }

    /// Token cancelled when the connection terminates.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    // ── Dialing ──────────────────────────────────────────────────

    /// Wake the dial task for the first attempt. The trigger channel is
    /// empty at registration time, so this cannot fail.
    pub(crate) fn kick_dial(&self) {
        if let Some(dial_tx) = &self.inner.dial_tx {
            let _ = dial_tx.try_send(None);
        }
    }

    /// Mark the connection `Dialing` and wake the dial task with the
    /// error that caused it.
    async fn trigger_dialing(&self, err: Option<NetError>) {
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if *state == ConnState::Closed {
                return;
            }
            *state = ConnState::Dialing;
        }
        let Some(dial_tx) = &self.inner.dial_tx else {
            return;
        };
        tokio::select! {
            _ = dial_tx.send(err) => {}
            _ = self.inner.closed.cancelled() => {}
        }
    }

    /// Transient-fault recovery. Incoming connections terminate; outgoing
    /// connections elect a single redial driver per stream.
    async fn io_fault(&self, err: NetError, link: &Link) {
        if self.inner.incoming {
            tracing::info!(address = %self.inner.address, %err, "incoming connection fault");
            self.close();
            return;
        }
        if self.inner.closed.is_cancelled() {
            return;
        }
        if link.fault.swap(true, Ordering::SeqCst) {
            return; // the other side is already driving this redial
        }
        tracing::warn!(address = %self.inner.address, %err, "i/o fault, redialing");
        link.token.cancel();
        self.trigger_dialing(Some(err)).await;
    }

    /// One dial attempt: TCP connect, then the optional TLS handshake,
    /// all under `dial_timeout` when one is configured.
    async fn dial_once(&self) -> Result<BoxStream, NetError> {
        let cfg = &self.inner.cfg;
        let address = self.inner.address.clone();
        let tls = cfg.tls.as_ref().and_then(|t| t.client.clone());
        let attempt = async move {
            let stream = TcpStream::connect(&address).await?;
            let _ = stream.set_nodelay(true);
            match tls {
                None => Ok::<BoxStream, NetError>(Box::new(stream)),
                Some(client_cfg) => {
                    let name = server_name(&address)?;
                    let connector = TlsConnector::from(client_cfg);
                    let stream = connector.connect(name, stream).await?;
                    Ok(Box::new(stream) as BoxStream)
                }
            }
        };
        if cfg.dial_timeout > Duration::ZERO {
            match tokio::time::timeout(cfg.dial_timeout, attempt).await {
                Ok(res) => res,
                Err(_) => Err(NetError::Timeout(cfg.dial_timeout)),
            }
        } else {
            attempt.await
        }
    }

    /// Deliver a fresh stream to both the read and the write task.
    /// Each task consumes exactly one attachment per cycle, so these
    /// capacity-1 sends cannot lodge a second stream behind a first.
    /// Returns false when shutdown interrupted the handoff.
    pub(crate) async fn attach_stream(&self, stream: BoxStream) -> bool {
        let (read_half, write_half) = tokio::io::split(stream);
        let link = Link::new();
        {
            let mut state = self.inner.state.lock().expect("state lock");
            if *state == ConnState::Closed {
                return false;
            }
            *state = ConnState::Connected;
        }
        tracing::debug!(address = %self.inner.address, "stream handoff");
        tokio::select! {
            res = self.inner.rl_tx.send((read_half, link.clone())) => {
                if res.is_err() {
                    return false;
                }
            }
            _ = self.inner.closed.cancelled() => return false,
        }
        tokio::select! {
            res = self.inner.wl_tx.send((write_half, link)) => res.is_ok(),
            _ = self.inner.closed.cancelled() => false,
        }
    }

    // ── Dial task ────────────────────────────────────────────────

    pub(crate) async fn run_dial(self, mut dial_rx: mpsc::Receiver<Option<NetError>>) {
        tracing::debug!(address = %self.inner.address, "dial task started");
        let cfg = self.inner.cfg.clone();
        let mut budget = DialBudget::new(cfg.dials_limit);
        'trigger: loop {
            let mut last_err = tokio::select! {
                trigger = dial_rx.recv() => match trigger {
                    Some(err) => err,
                    None => break 'trigger,
                },
                _ = self.inner.closed.cancelled() => break 'trigger,
            };
            let mut backoff = cfg.redial_timeout;
            loop {
                if !budget.take() {
                    tracing::info!(address = %self.inner.address, "dial budget exhausted");
                    break 'trigger;
                }
                if let Some(policy) = &cfg.on_dial {
                    if let Err(err) = policy(&self, last_err.as_ref()) {
                        tracing::info!(address = %self.inner.address, %err, "dial rejected by policy");
                        break 'trigger;
                    }
                }
                match self.dial_once().await {
                    Ok(stream) => {
                        if !self.attach_stream(stream).await {
                            break 'trigger;
                        }
                        continue 'trigger;
                    }
                    Err(err @ NetError::Rejected(_)) => {
                        tracing::error!(address = %self.inner.address, %err, "dial refused");
                        break 'trigger;
                    }
                    Err(err) => {
                        tracing::warn!(address = %self.inner.address, %err, "dial failed");
                        backoff = grow_backoff(backoff, cfg.max_redial_timeout);
                        if backoff > Duration::ZERO {
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = self.inner.closed.cancelled() => break 'trigger,
                            }
                        } else if self.inner.closed.is_cancelled() {
                            break 'trigger;
                        }
                        last_err = Some(err);
                    }
                }
            }
        }
        tracing::debug!(address = %self.inner.address, "dial task stopped");
        self.close();
    }

    // ── Read task ────────────────────────────────────────────────

    pub(crate) async fn run_read(
        self,
        mut rl_rx: mpsc::Receiver<ReadAttach>,
        readq_tx: mpsc::Sender<Bytes>,
    ) {
        tracing::debug!(address = %self.inner.address, "read task started");
        let cfg = self.inner.cfg.clone();
        'attach: loop {
            let (half, link) = tokio::select! {
                attach = rl_rx.recv() => match attach {
                    Some(attach) => attach,
                    None => break 'attach,
                },
                _ = self.inner.closed.cancelled() => break 'attach,
            };
            let io = TimedIo::new(half, cfg.read_timeout, self.inner.last_read.clone());
            let codec = FrameCodec::new(cfg.max_message_size);
            let mut framed: Reader = if cfg.read_buffer_size > 0 {
                FramedRead::with_capacity(io, codec, cfg.read_buffer_size)
            } else {
                FramedRead::new(io, codec)
            };
            loop {
                let frame = tokio::select! {
                    frame = framed.next() => frame,
                    // The write side faulted: release our half of the old
                    // stream and park for the replacement.
                    _ = link.token.cancelled() => continue 'attach,
                    _ = self.inner.closed.cancelled() => break 'attach,
                };
                match frame {
                    Some(Ok(payload)) => {
                        tokio::select! {
                            res = readq_tx.send(payload) => {
                                if res.is_err() {
                                    break 'attach;
                                }
                            }
                            _ = self.inner.closed.cancelled() => break 'attach,
                        }
                    }
                    Some(Err(err)) if err.is_fatal() => {
                        tracing::error!(address = %self.inner.address, %err, "fatal read error");
                        break 'attach;
                    }
                    Some(Err(err)) => {
                        self.io_fault(err, &link).await;
                        continue 'attach;
                    }
                    None => {
                        let err = NetError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed by peer",
                        ));
                        self.io_fault(err, &link).await;
                        continue 'attach;
                    }
                }
            }
        }
        tracing::debug!(address = %self.inner.address, "read task stopped");
        self.close();
    }

    // ── Write task ───────────────────────────────────────────────

    pub(crate) async fn run_write(
        self,
        mut wl_rx: mpsc::Receiver<WriteAttach>,
        mut writeq_rx: mpsc::Receiver<Bytes>,
    ) {
        tracing::debug!(address = %self.inner.address, "write task started");
        let cfg = self.inner.cfg.clone();
        'attach: loop {
            let (half, link) = tokio::select! {
                attach = wl_rx.recv() => match attach {
                    Some(attach) => attach,
                    None => break 'attach,
                },
                _ = self.inner.closed.cancelled() => break 'attach,
            };
            let io = TimedIo::new(half, cfg.write_timeout, self.inner.last_write.clone());
            let mut framed: Writer = FramedWrite::new(io, FrameCodec::new(cfg.max_message_size));
            loop {
                let msg = tokio::select! {
                    msg = writeq_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break 'attach,
                    },
                    // Redial driven by the read side: release the stream
                    // without triggering a second dial.
                    _ = link.token.cancelled() => continue 'attach,
                    _ = self.inner.closed.cancelled() => break 'attach,
                };
                match self.write_frame(&mut framed, msg, &link).await {
                    WriteOutcome::Ok => {}
                    WriteOutcome::Detach => continue 'attach,
                    WriteOutcome::Stop => break 'attach,
                }
                // Drain whatever else is queued without blocking, then
                // flush so the peer sees everything before we park again.
                loop {
                    match writeq_rx.try_recv() {
                        Ok(msg) => match self.write_frame(&mut framed, msg, &link).await {
                            WriteOutcome::Ok => {}
                            WriteOutcome::Detach => continue 'attach,
                            WriteOutcome::Stop => break 'attach,
                        },
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => break 'attach,
                    }
                }
                match self.flush(&mut framed, &link).await {
                    WriteOutcome::Ok => {}
                    WriteOutcome::Detach => continue 'attach,
                    WriteOutcome::Stop => break 'attach,
                }
            }
        }
        tracing::debug!(address = %self.inner.address, "write task stopped");
        self.close();
    }

    async fn write_frame(&self, framed: &mut Writer, msg: Bytes, link: &Link) -> WriteOutcome {
        let res = tokio::select! {
            res = framed.feed(msg) => res,
            _ = link.token.cancelled() => return WriteOutcome::Detach,
            _ = self.inner.closed.cancelled() => return WriteOutcome::Stop,
        };
        match res {
            Ok(()) => {
                if self.inner.cfg.write_buffer_size == 0 {
                    // Unbuffered: push every frame out as it is encoded.
                    return self.flush(framed, link).await;
                }
                WriteOutcome::Ok
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(address = %self.inner.address, %err, "fatal write error");
                WriteOutcome::Stop
            }
            Err(err) => {
                self.io_fault(err, link).await;
                WriteOutcome::Detach
            }
        }
    }

    async fn flush(&self, framed: &mut Writer, link: &Link) -> WriteOutcome {
        let res = tokio::select! {
            res = framed.flush() => res,
            _ = link.token.cancelled() => return WriteOutcome::Detach,
            _ = self.inner.closed.cancelled() => return WriteOutcome::Stop,
        };
        match res {
            Ok(()) => WriteOutcome::Ok,
            Err(err) if err.is_fatal() => WriteOutcome::Stop,
            Err(err) => {
                self.io_fault(err, link).await;
                WriteOutcome::Detach
            }
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("address", &self.inner.address)
            .field("incoming", &self.inner.incoming)
            .field("state", &self.state())
            .finish()
    }
}

enum WriteOutcome {
    /// Frame handled, keep going on the current stream.
    Ok,
    /// Release the current stream and park for the next handoff.
    Detach,
    /// Terminate the write task (and with it the connection).
    Stop,
}

// ── Helpers ──────────────────────────────────────────────────────

/// Dial-attempt budget; zero configured attempts means no limit.
struct DialBudget {
    left: u32,
    infinite: bool,
}

impl DialBudget {
    fn new(limit: u32) -> Self {
        Self {
            left: limit,
            infinite: limit == 0,
        }
    }

    fn take(&mut self) -> bool {
        if self.infinite {
            return true;
        }
        if self.left == 0 {
            return false;
        }
        self.left -= 1;
        true
    }
}

/// Backoff growth after a failed dial: start at 100 ms, double, clamp at
/// `max`. A `max` at or below the current value freezes the backoff.
fn grow_backoff(current: Duration, max: Duration) -> Duration {
    if max <= current {
        return current;
    }
    let grown = if current.is_zero() {
        Duration::from_millis(100)
    } else {
        current.saturating_mul(2)
    };
    grown.min(max)
}

/// Host part of a `host:port` address, for TLS server-name verification.
fn server_name(address: &str) -> Result<rustls::pki_types::ServerName<'static>, NetError> {
    let host = match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    };
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| NetError::Rejected(format!("invalid TLS server name: {host}")))
}
