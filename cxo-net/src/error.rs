//! Error types for the connection engine.
//!
//! All fallible operations return `Result<T, NetError>`. The engine keeps
//! two classifications on top of the variants themselves: transient faults
//! redial an outgoing connection, fatal ones terminate it.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for the connection engine.
#[derive(Debug, Error)]
pub enum NetError {
    // ── Transient I/O ────────────────────────────────────────────
    /// The TCP/TLS layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Protocol-fatal ───────────────────────────────────────────
    /// A frame exceeded the configured maximum message size.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame length prefix does not fit the host address width.
    #[error("frame length {0} overflows host usize")]
    LengthOverflow(u32),

    // ── Policy ───────────────────────────────────────────────────
    /// The dial policy refused to (re)dial this peer.
    #[error("dial rejected: {0}")]
    Rejected(String),

    // ── Pool misuse ──────────────────────────────────────────────
    /// A connection to this address is already registered.
    #[error("connection already exists: {0}")]
    AlreadyExists(String),

    /// The pool already has a running listener.
    #[error("already listening")]
    AlreadyListening,

    /// The pool or connection has been closed.
    #[error("closed")]
    Closed,

    /// A configuration value is out of bounds.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl NetError {
    /// True for conditions that leave the wire desynchronized beyond
    /// recovery. A fatal error terminates the connection instead of
    /// redialing it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetError::FrameTooLarge { .. } | NetError::LengthOverflow(_)
        )
    }

    /// True when the error shows the remote peer shut the connection down
    /// on purpose: end-of-stream or connection reset.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            NetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}
