//! Peer-to-peer connection engine for the CXO content-distribution node.
//!
//! The engine maintains a pool of length-prefix framed TCP (or TLS) peer
//! connections. Every connection runs an independent redial-capable
//! harness with bounded inbound and outbound queues, per-operation
//! deadlines, and coordinated graceful shutdown. Payloads are opaque byte
//! slices; the engine imposes no further semantics.
//!
//! ```no_run
//! use cxo_net::{Config, Pool};
//!
//! # async fn demo() -> Result<(), cxo_net::NetError> {
//! let listener = Pool::new(Config::default())?;
//! let addr = listener.listen("127.0.0.1:0").await?;
//!
//! let dialer = Pool::new(Config::default())?;
//! let conn = dialer.dial(&addr.to_string())?;
//! conn.send(&b"hello"[..]).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;

mod codec;
mod error;
mod network;

pub use codec::{FrameCodec, HEAD_LEN};
pub use config::{dial_error_filter, Config, OnConn, OnDial, TlsSettings};
pub use error::NetError;
pub use network::connection::{Conn, ConnState};
pub use network::pool::Pool;
