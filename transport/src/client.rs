use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{ACK, READY};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends a single message line and waits for ACK.
/// Protocol: connect -> consume READY -> send line -> expect ACK.
pub async fn send_message(host: &str, port: u16, message: &str) -> bool {
    match exchange(host, port, message).await {
        Some(reply) if reply == ACK => {
            debug!(%host, port, "message delivered");
            true
        }
        Some(reply) => {
            warn!(%host, port, %reply, "server did not acknowledge");
            false
        }
        None => false,
    }
}

/// Line-based request/response helper: consumes READY, sends the request,
/// and returns the first reply line.
pub async fn send_request(host: &str, port: u16, request: &str) -> Option<String> {
    exchange(host, port, request).await
}

async fn exchange(host: &str, port: u16, line: &str) -> Option<String> {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%host, port, error = %e, "failed to connect");
            return None;
        }
        Err(_) => {
            warn!(%host, port, "connect timed out");
            return None;
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    match timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(greeting))) if greeting == READY => {}
        other => {
            warn!(%host, port, ?other, "server not ready");
            return None;
        }
    }

    if let Err(e) = write_half.write_all(format!("{line}\n").as_bytes()).await {
        warn!(%host, port, error = %e, "failed to send line");
        return None;
    }

    match timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(reply)) => reply,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::{InboundHandler, LineServer};

    struct Recorder {
        lines: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn handle_line(&self, line: String) {
            let _ = self.lines.send(line);
        }
    }

    #[tokio::test]
    async fn round_trip_delivers_and_acks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = LineServer::new(Arc::new(Recorder { lines: tx }));
        let addr = server.start(0).await.unwrap();

        assert!(send_message("127.0.0.1", addr.port(), "over the wire").await);
        assert_eq!(rx.recv().await.as_deref(), Some("over the wire"));

        server.stop();
    }

    #[tokio::test]
    async fn health_request_gets_pong() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = LineServer::new(Arc::new(Recorder { lines: tx }));
        let addr = server.start(0).await.unwrap();

        let reply = send_request("127.0.0.1", addr.port(), "PING").await;
        assert_eq!(reply.as_deref(), Some("PONG"));

        server.stop();
    }

    #[tokio::test]
    async fn send_to_dead_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!send_message("127.0.0.1", port, "nobody home").await);
    }
}
