//! Connection pool: registry, listener, dial entry point, and the
//! shutdown barrier that waits for every harness task.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::error::NetError;
use crate::network::connection::{self, BoxStream, Conn};

// ── Shared state ─────────────────────────────────────────────────

pub(crate) struct PoolShared {
    pub(crate) cfg: Arc<Config>,
    registry: Mutex<Registry>,
    pub(crate) tracker: TaskTracker,
    closed: CancellationToken,
    close_flag: AtomicBool,
    listening: AtomicBool,
    listener_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Default)]
struct Registry {
    conns: HashMap<String, Conn>,
    /// Copy-on-write cache served by `connections()`, cleared on every
    /// registry mutation.
    snapshot: Option<Vec<Conn>>,
}

impl PoolShared {
    /// Drop a connection from the registry. Called by `Conn::close`.
    pub(crate) fn remove(&self, address: &str) {
        let mut registry = self.registry.lock().expect("registry lock");
        if registry.conns.remove(address).is_some() {
            registry.snapshot = None;
        }
    }

    fn notify_created(self: &Arc<Self>, conn: &Conn) {
        if let Some(callback) = self.cfg.on_create_connection.clone() {
            let conn = conn.clone();
            self.tracker.spawn(async move { callback(conn) });
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────────

/// Process-wide collector of peer connections.
///
/// Cheap to clone; every clone refers to the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Validate the configuration and create an empty pool.
    pub fn new(cfg: Config) -> Result<Self, NetError> {
        cfg.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                cfg: Arc::new(cfg),
                registry: Mutex::new(Registry::default()),
                tracker: TaskTracker::new(),
                closed: CancellationToken::new(),
                close_flag: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                listener_addr: Mutex::new(None),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Address the listener is bound to, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.listener_addr.lock().expect("listener lock")
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<Conn> {
        let mut registry = self.shared.registry.lock().expect("registry lock");
        if registry.snapshot.is_none() {
            registry.snapshot = Some(registry.conns.values().cloned().collect());
        }
        registry.snapshot.clone().unwrap_or_default()
    }

    // ── Dial ─────────────────────────────────────────────────────

    /// Register an outgoing connection and start dialing it in the
    /// background; the returned connection is usually still `Dialing`.
    /// Fails synchronously if the address is already registered.
    pub fn dial(&self, address: &str) -> Result<Conn, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        let conn = {
            let mut registry = self.shared.registry.lock().expect("registry lock");
            if registry.conns.contains_key(address) {
                return Err(NetError::AlreadyExists(address.to_string()));
            }
            let (conn, harness) = Conn::new(
                address.to_string(),
                false,
                self.shared.cfg.clone(),
                Arc::downgrade(&self.shared),
                &self.shared.closed,
            );
            registry.conns.insert(address.to_string(), conn.clone());
            registry.snapshot = None;
            connection::start(&conn, harness, &self.shared.tracker);
            conn
        };
        tracing::info!(address = %conn.address(), "dialing peer");
        conn.kick_dial();
        self.shared.notify_created(&conn);
        Ok(conn)
    }

    // ── Listen ───────────────────────────────────────────────────

    /// Bind a listener and start accepting peers until the pool closes.
    /// Returns the bound address (useful with a `:0` port). A pool runs
    /// at most one listener.
    pub async fn listen(&self, address: &str) -> Result<SocketAddr, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        if self.shared.listening.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyListening);
        }
        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.listening.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        let local = listener.local_addr()?;
        *self.shared.listener_addr.lock().expect("listener lock") = Some(local);
        tracing::info!(%local, "listening");

        let shared = self.shared.clone();
        self.shared
            .tracker
            .spawn(async move { accept_loop(shared, listener).await });
        Ok(local)
    }

    // ── Close ────────────────────────────────────────────────────

    /// Close the listener, terminate every connection, and wait for all
    /// harness tasks to exit. Safe to call more than once; later calls
    /// only wait for the barrier.
    pub async fn close(&self) {
        if !self.shared.close_flag.swap(true, Ordering::SeqCst) {
            tracing::info!("closing pool");
            self.shared.closed.cancel();
            for conn in self.connections() {
                conn.close();
            }
            self.shared.tracker.close();
        }
        self.shared.tracker.wait().await;
    }
}

// ── Accepting ────────────────────────────────────────────────────

/// Accepts until the pool closes. Transient failures are logged and
/// retried after a short pause; anything else stops the listener.
async fn accept_loop(shared: Arc<PoolShared>, listener: TcpListener) {
    let acceptor = shared
        .cfg
        .tls
        .as_ref()
        .and_then(|t| t.server.clone())
        .map(TlsAcceptor::from);
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(err) if is_transient_accept(&err) => {
                    tracing::warn!(%err, "transient accept error");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                        _ = shared.closed.cancelled() => break,
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "listener failed");
                    break;
                }
            },
            _ = shared.closed.cancelled() => break,
        };
        let _ = stream.set_nodelay(true);
        // The TLS handshake must not stall the accept loop, so every
        // accepted socket is registered from its own task.
        let tracker = shared.tracker.clone();
        let shared = shared.clone();
        let acceptor = acceptor.clone();
        tracker.spawn(async move { accept_stream(shared, stream, peer, acceptor).await });
    }
    tracing::debug!("accept loop stopped");
}

fn is_transient_accept(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Register one accepted stream, performing the TLS handshake when
/// configured. Duplicate and over-capacity peers are dropped, which
/// closes their sockets.
async fn accept_stream(
    shared: Arc<PoolShared>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let address = peer.to_string();
    let stream: BoxStream = match acceptor {
        None => Box::new(stream),
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Box::new(tls),
            Err(err) => {
                tracing::warn!(%address, %err, "TLS handshake failed");
                return;
            }
        },
    };
    let conn = {
        let mut registry = shared.registry.lock().expect("registry lock");
        let max = shared.cfg.max_connections;
        if max > 0 && registry.conns.len() >= max {
            tracing::warn!(%address, "connection limit reached, rejecting peer");
            return;
        }
        if registry.conns.contains_key(&address) {
            tracing::warn!(%address, "connection already exists, rejecting peer");
            return;
        }
        let (conn, harness) = Conn::new(
            address.clone(),
            true,
            shared.cfg.clone(),
            Arc::downgrade(&shared),
            &shared.closed,
        );
        registry.conns.insert(address, conn.clone());
        registry.snapshot = None;
        connection::start(&conn, harness, &shared.tracker);
        conn
    };
    tracing::info!(address = %conn.address(), "accepted connection");
    shared.notify_created(&conn);
    conn.attach_stream(stream).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dials never give up and back off for a long time, so an outgoing
    /// connection stays registered for the whole test.
    fn quick_config() -> Config {
        Config::default().with_redial_timeouts(Duration::from_secs(10), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn dial_rejects_duplicate_address() {
        let pool = Pool::new(quick_config()).unwrap();
        let _conn = pool.dial("127.0.0.1:4000").unwrap();
        let err = pool.dial("127.0.0.1:4000").unwrap_err();
        assert!(matches!(err, NetError::AlreadyExists(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn dial_after_close_fails() {
        let pool = Pool::new(quick_config()).unwrap();
        pool.close().await;
        assert!(matches!(
            pool.dial("127.0.0.1:4000"),
            Err(NetError::Closed)
        ));
    }

    #[tokio::test]
    async fn only_one_listener_per_pool() {
        let pool = Pool::new(quick_config()).unwrap();
        pool.listen("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            pool.listen("127.0.0.1:0").await,
            Err(NetError::AlreadyListening)
        ));
        assert!(pool.local_addr().is_some());
        pool.close().await;
    }

    #[tokio::test]
    async fn connections_snapshot_tracks_registry() {
        let pool = Pool::new(quick_config()).unwrap();
        assert!(pool.connections().is_empty());

        let conn = pool.dial("127.0.0.1:4001").unwrap();
        let snap = pool.connections();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].address(), "127.0.0.1:4001");

        conn.close();
        assert!(pool.connections().is_empty());
        pool.close().await;
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = Config::default().with_queue_lens(0, 0);
        assert!(Pool::new(cfg).is_err());
    }
}
