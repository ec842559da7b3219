//! Environment-driven settings for the echo binary.

use std::time::Duration;

/// Echo-server modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// Mirror raw bytes.
    Raw,
    /// Echo one line per exchange.
    Line,
}

#[derive(Clone)]
pub struct Config {
    /// Address to listen on, in the listener grammar (`LISTEN`).
    pub listen_addr: String,

    /// Echo flavor (`MODE`: `raw` or `line`).
    pub mode: EchoMode,

    /// Optional bound on how long a shutdown may wait for connections to
    /// drain (`SHUTDOWN_TIMEOUT`, seconds).
    pub shutdown_timeout: Option<Duration>,
}

impl Config {
    pub fn load() -> Self {
        let listen_addr =
            std::env::var("LISTEN").unwrap_or_else(|_| "127.0.0.1:4242".to_string());

        let mode = match std::env::var("MODE").as_deref() {
            Ok("line") => EchoMode::Line,
            _ => EchoMode::Raw,
        };

        let shutdown_timeout = std::env::var("SHUTDOWN_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        Self {
            listen_addr,
            mode,
            shutdown_timeout,
        }
    }
}
