mod client;
mod server;

pub use client::{send_message, send_request};
pub use server::LineServer;

use async_trait::async_trait;

// Line protocol vocabulary (UTF-8, LF-terminated).
pub const READY: &str = "READY";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const ACK: &str = "ACK";
pub const EXIT: &str = "EXIT";

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already running")]
    AlreadyRunning,
}

/// Application hook for inbound message lines. The server replies ACK
/// after the handler returns.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_line(&self, line: String);
}
