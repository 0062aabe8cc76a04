//! CXO peer node — entry point.
//!
//! ```text
//! cxo-node --address 0.0.0.0:8870                 Listen for peers
//! cxo-node --connect host:8870 --connect ...      Dial peers
//! cxo-node --address :8870 --connect host:8870    Both at once
//! ```
//!
//! Binds the connection-engine configuration to command-line flags,
//! starts a pool, and relays every received payload into the log. Idle
//! connections are kept alive with empty ping frames.

use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cxo_net::{dial_error_filter, Config, Conn, NetError, Pool};

// ── CLI ──────────────────────────────────────────────────────────

/// Parse `150ms` / `5s` / `2m` / `1.5h` style durations.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let unit_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(unit_at);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    let seconds = match unit {
        "ns" => value / 1e9,
        "us" => value / 1e6,
        "ms" => value / 1e3,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("unknown duration unit: {unit:?}")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[derive(Parser, Debug)]
#[command(name = "cxo-node", about = "CXO content-distribution peer node")]
struct Cli {
    /// Listening address (omit to disable listening).
    #[arg(long)]
    address: Option<String>,

    /// Peer to dial at startup; repeatable.
    #[arg(long)]
    connect: Vec<String>,

    /// Hard cap on registered connections (0 = unbounded).
    #[arg(long = "max-conns", default_value_t = cxo_net::config::MAX_CONNECTIONS)]
    max_conns: usize,

    /// Maximum message payload size in bytes (0 = unbounded).
    #[arg(long = "max-msg-size", default_value_t = cxo_net::config::MAX_MESSAGE_SIZE)]
    max_msg_size: usize,

    /// Per-attempt dial deadline (0 = none).
    #[arg(long = "dial-timeout", value_parser = parse_duration, default_value = "5s")]
    dial_timeout: Duration,

    /// Per-operation read deadline (0 = none).
    #[arg(long = "read-timeout", value_parser = parse_duration, default_value = "0s")]
    read_timeout: Duration,

    /// Per-operation write deadline (0 = none).
    #[arg(long = "write-timeout", value_parser = parse_duration, default_value = "0s")]
    write_timeout: Duration,

    /// Inbound queue capacity per connection.
    #[arg(long = "read-qlen", default_value_t = cxo_net::config::READ_QUEUE_LEN)]
    read_qlen: usize,

    /// Outbound queue capacity per connection.
    #[arg(long = "write-qlen", default_value_t = cxo_net::config::WRITE_QUEUE_LEN)]
    write_qlen: usize,

    /// Initial backoff after a failed dial.
    #[arg(long = "redial-timeout", value_parser = parse_duration, default_value = "100ms")]
    redial_timeout: Duration,

    /// Upper bound on the exponentially grown backoff.
    #[arg(long = "max-redial-timeout", value_parser = parse_duration, default_value = "5s")]
    max_redial_timeout: Duration,

    /// Maximum dial attempts per connection (0 = infinite).
    #[arg(long = "redials-limit", default_value_t = cxo_net::config::DIALS_LIMIT)]
    redials_limit: u32,

    /// Read buffer size in bytes (0 = unbuffered).
    #[arg(long = "read-buf", default_value_t = cxo_net::config::READ_BUFFER_SIZE)]
    read_buf: usize,

    /// Write buffer size in bytes (0 = unbuffered).
    #[arg(long = "write-buf", default_value_t = cxo_net::config::WRITE_BUFFER_SIZE)]
    write_buf: usize,

    /// Interval between keep-alive pings on idle connections (0 = off).
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    ping: Duration,
}

impl Cli {
    fn to_config(&self) -> Config {
        Config::default()
            .with_max_connections(self.max_conns)
            .with_max_message_size(self.max_msg_size)
            .with_dial_timeout(self.dial_timeout)
            .with_read_timeout(self.read_timeout)
            .with_write_timeout(self.write_timeout)
            .with_queue_lens(self.read_qlen, self.write_qlen)
            .with_redial_timeouts(self.redial_timeout, self.max_redial_timeout)
            .with_dials_limit(self.redials_limit)
            .with_buffer_sizes(self.read_buf, self.write_buf)
            .with_on_dial(dial_error_filter)
            .with_on_create_connection(|conn: Conn| {
                tokio::spawn(pump(conn));
            })
            .with_on_close_connection(|conn: Conn| {
                info!(address = %conn.address(), "connection closed");
            })
    }
}

// ── Peer plumbing ────────────────────────────────────────────────

/// Drain one connection's inbound queue into the log.
async fn pump(conn: Conn) {
    info!(
        address = %conn.address(),
        incoming = conn.is_incoming(),
        "peer connected"
    );
    while let Some(msg) = conn.recv().await {
        if msg.is_empty() {
            continue; // keep-alive ping
        }
        info!(address = %conn.address(), len = msg.len(), "message received");
    }
}

/// Send an empty keep-alive frame on connections idle longer than the
/// interval.
async fn ping_loop(pool: Pool, every: Duration) {
    let mut ticks = tokio::time::interval(every);
    loop {
        ticks.tick().await;
        for conn in pool.connections() {
            if conn.last_write().elapsed() >= every {
                let _ = conn.sender().try_send(Bytes::new());
            }
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), NetError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    info!("cxo-node v{}", env!("CARGO_PKG_VERSION"));

    let pool = Pool::new(cli.to_config())?;

    if let Some(address) = &cli.address {
        let local = pool.listen(address).await?;
        info!(%local, "listening for peers");
    }
    for peer in &cli.connect {
        if let Err(err) = pool.dial(peer) {
            error!(%peer, %err, "dial failed");
        }
    }
    if cli.ping > Duration::ZERO {
        tokio::spawn(ping_loop(pool.clone(), cli.ping));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    pool.close().await;
    Ok(())
}
