//! Pool configuration.
//!
//! Defaults live in named constants so tests and embedders can refer to
//! them. Zero disables a limit or timeout everywhere except the queue
//! lengths, which must hold at least one message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::NetError;
use crate::network::connection::Conn;

// ── Defaults ─────────────────────────────────────────────────────

/// Default hard cap on the number of registered connections.
pub const MAX_CONNECTIONS: usize = 16;
/// Default maximum encoded/decoded payload length (8 MiB).
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
/// Default per-attempt dial deadline.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-operation read deadline (disabled).
pub const READ_TIMEOUT: Duration = Duration::ZERO;
/// Default per-operation write deadline (disabled).
pub const WRITE_TIMEOUT: Duration = Duration::ZERO;
/// Default inbound queue capacity.
pub const READ_QUEUE_LEN: usize = 128;
/// Default outbound queue capacity.
pub const WRITE_QUEUE_LEN: usize = 128;
/// Default initial redial backoff.
pub const REDIAL_TIMEOUT: Duration = Duration::from_millis(100);
/// Default upper bound on the grown redial backoff.
pub const MAX_REDIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default dial-attempt budget per connection (0 = infinite).
pub const DIALS_LIMIT: u32 = 0;
/// Default read buffer size in bytes.
pub const READ_BUFFER_SIZE: usize = 4096;
/// Default write buffer size in bytes.
pub const WRITE_BUFFER_SIZE: usize = 4096;

// ── Callbacks ────────────────────────────────────────────────────

/// Dial policy. Receives the connection and the error that caused this
/// (re)dial, `None` on the first attempt. Returning `Err` closes the
/// connection instead of dialing again.
pub type OnDial = Arc<dyn Fn(&Conn, Option<&NetError>) -> Result<(), NetError> + Send + Sync>;

/// Connection lifecycle notification. Runs on its own task and must not
/// block for long.
pub type OnConn = Arc<dyn Fn(Conn) + Send + Sync>;

/// Standard dial policy: give up when the previous fault shows the remote
/// peer closed the connection on purpose (end-of-stream or connection
/// reset), keep redialing on anything else.
pub fn dial_error_filter(_conn: &Conn, last: Option<&NetError>) -> Result<(), NetError> {
    match last {
        Some(err) if err.is_peer_closed() => Err(NetError::Rejected(err.to_string())),
        _ => Ok(()),
    }
}

// ── TLS ──────────────────────────────────────────────────────────

/// Transport-security parameters. Dialing wraps the TCP stream with
/// `client`; the listener wraps accepted streams with `server`. Either
/// side may be absent.
#[derive(Clone)]
pub struct TlsSettings {
    pub client: Option<Arc<rustls::ClientConfig>>,
    pub server: Option<Arc<rustls::ServerConfig>>,
}

// ── Config ───────────────────────────────────────────────────────

/// Pool configuration, immutable once the pool starts.
#[derive(Clone)]
pub struct Config {
    /// Hard cap on registry size (0 = unbounded).
    pub max_connections: usize,
    /// Maximum payload length on the wire (0 = unbounded).
    pub max_message_size: usize,
    /// Per-attempt dial deadline (0 = none).
    pub dial_timeout: Duration,
    /// Per-operation read deadline (0 = none).
    pub read_timeout: Duration,
    /// Per-operation write deadline (0 = none).
    pub write_timeout: Duration,
    /// Inbound queue capacity.
    pub read_queue_len: usize,
    /// Outbound queue capacity.
    pub write_queue_len: usize,
    /// Initial backoff after a failed dial.
    pub redial_timeout: Duration,
    /// Upper bound on the exponentially grown backoff.
    pub max_redial_timeout: Duration,
    /// Maximum dial attempts per connection lifetime (0 = infinite).
    pub dials_limit: u32,
    /// Read buffering in bytes (0 = unbuffered).
    pub read_buffer_size: usize,
    /// Write buffering in bytes (0 = flush after every frame).
    pub write_buffer_size: usize,
    /// Optional transport security.
    pub tls: Option<TlsSettings>,
    /// Dial policy, consulted before every attempt.
    pub on_dial: Option<OnDial>,
    /// Fired once per registered connection.
    pub on_create_connection: Option<OnConn>,
    /// Fired once per connection, after it left the registry.
    pub on_close_connection: Option<OnConn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            max_message_size: MAX_MESSAGE_SIZE,
            dial_timeout: DIAL_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            read_queue_len: READ_QUEUE_LEN,
            write_queue_len: WRITE_QUEUE_LEN,
            redial_timeout: REDIAL_TIMEOUT,
            max_redial_timeout: MAX_REDIAL_TIMEOUT,
            dials_limit: DIALS_LIMIT,
            read_buffer_size: READ_BUFFER_SIZE,
            write_buffer_size: WRITE_BUFFER_SIZE,
            tls: None,
            on_dial: None,
            on_create_connection: None,
            on_close_connection: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds checks that the pool relies on. The queues are bounded
    /// channels and must hold at least one message; a non-zero backoff
    /// ceiling below the floor would shrink on "growth".
    pub fn validate(&self) -> Result<(), NetError> {
        if self.read_queue_len == 0 {
            return Err(NetError::Config("read_queue_len must be at least 1"));
        }
        if self.write_queue_len == 0 {
            return Err(NetError::Config("write_queue_len must be at least 1"));
        }
        if self.max_redial_timeout > Duration::ZERO && self.max_redial_timeout < self.redial_timeout
        {
            return Err(NetError::Config("max_redial_timeout is below redial_timeout"));
        }
        Ok(())
    }

    // ── Builder ──────────────────────────────────────────────────

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_max_message_size(mut self, n: usize) -> Self {
        self.max_message_size = n;
        self
    }

    pub fn with_dial_timeout(mut self, t: Duration) -> Self {
        self.dial_timeout = t;
        self
    }

    pub fn with_read_timeout(mut self, t: Duration) -> Self {
        self.read_timeout = t;
        self
    }

    pub fn with_write_timeout(mut self, t: Duration) -> Self {
        self.write_timeout = t;
        self
    }

    pub fn with_queue_lens(mut self, read: usize, write: usize) -> Self {
        self.read_queue_len = read;
        self.write_queue_len = write;
        self
    }

    pub fn with_redial_timeouts(mut self, initial: Duration, max: Duration) -> Self {
        self.redial_timeout = initial;
        self.max_redial_timeout = max;
        self
    }

    pub fn with_dials_limit(mut self, n: u32) -> Self {
        self.dials_limit = n;
        self
    }

    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_on_dial<F>(mut self, f: F) -> Self
    where
        F: Fn(&Conn, Option<&NetError>) -> Result<(), NetError> + Send + Sync + 'static,
    {
        self.on_dial = Some(Arc::new(f));
        self
    }

    pub fn with_on_create_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(Conn) + Send + Sync + 'static,
    {
        self.on_create_connection = Some(Arc::new(f));
        self
    }

    pub fn with_on_close_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(Conn) + Send + Sync + 'static,
    {
        self.on_close_connection = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_connections", &self.max_connections)
            .field("max_message_size", &self.max_message_size)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("read_queue_len", &self.read_queue_len)
            .field("write_queue_len", &self.write_queue_len)
            .field("redial_timeout", &self.redial_timeout)
            .field("max_redial_timeout", &self.max_redial_timeout)
            .field("dials_limit", &self.dials_limit)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("tls", &self.tls.is_some())
            .field("on_dial", &self.on_dial.is_some())
            .field("on_create_connection", &self.on_create_connection.is_some())
            .field("on_close_connection", &self.on_close_connection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let c = Config::default();
        assert_eq!(c.max_connections, MAX_CONNECTIONS);
        assert_eq!(c.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(c.dial_timeout, DIAL_TIMEOUT);
        assert_eq!(c.read_timeout, READ_TIMEOUT);
        assert_eq!(c.write_timeout, WRITE_TIMEOUT);
        assert_eq!(c.read_queue_len, READ_QUEUE_LEN);
        assert_eq!(c.write_queue_len, WRITE_QUEUE_LEN);
        assert_eq!(c.redial_timeout, REDIAL_TIMEOUT);
        assert_eq!(c.max_redial_timeout, MAX_REDIAL_TIMEOUT);
        assert_eq!(c.dials_limit, DIALS_LIMIT);
        assert_eq!(c.read_buffer_size, READ_BUFFER_SIZE);
        assert_eq!(c.write_buffer_size, WRITE_BUFFER_SIZE);
        assert!(c.tls.is_none());
        assert!(c.on_dial.is_none());
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_queues() {
        let c = Config::default().with_queue_lens(0, 8);
        assert!(matches!(c.validate(), Err(NetError::Config(_))));

        let c = Config::default().with_queue_lens(8, 0);
        assert!(matches!(c.validate(), Err(NetError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let c = Config::default()
            .with_redial_timeouts(Duration::from_secs(10), Duration::from_secs(1));
        assert!(matches!(c.validate(), Err(NetError::Config(_))));

        // Zero ceiling means "never grow", which is fine.
        let c = Config::default()
            .with_redial_timeouts(Duration::from_secs(10), Duration::ZERO);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn builder_sets_every_field() {
        let c = Config::new()
            .with_max_connections(3)
            .with_max_message_size(53)
            .with_dial_timeout(Duration::from_nanos(53))
            .with_read_timeout(Duration::from_nanos(53))
            .with_write_timeout(Duration::from_nanos(53))
            .with_queue_lens(53, 53)
            .with_redial_timeouts(Duration::from_nanos(53), Duration::from_nanos(53))
            .with_dials_limit(53)
            .with_buffer_sizes(53, 53)
            .with_on_dial(dial_error_filter);

        assert_eq!(c.max_connections, 3);
        assert_eq!(c.max_message_size, 53);
        assert_eq!(c.dial_timeout, Duration::from_nanos(53));
        assert_eq!(c.read_queue_len, 53);
        assert_eq!(c.write_queue_len, 53);
        assert_eq!(c.redial_timeout, Duration::from_nanos(53));
        assert_eq!(c.max_redial_timeout, Duration::from_nanos(53));
        assert_eq!(c.dials_limit, 53);
        assert_eq!(c.read_buffer_size, 53);
        assert_eq!(c.write_buffer_size, 53);
        assert!(c.on_dial.is_some());
    }
}
