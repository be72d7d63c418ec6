use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::Config;

const HEALTH_PING: &str = "PING";
const HEALTH_PONG: &str = "PONG";

/// Health-check handshake against a peer's transport port:
/// connect, consume the greeting line, send `PING`, expect `PONG`.
/// Any I/O error, timeout, or mismatched reply is a miss.
pub async fn probe_peer(peer: &str, config: &Config) -> bool {
    let Some((host, port)) = split_host_port(peer) else {
        return false;
    };

    let stream = match timeout(config.connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        _ => return false,
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Server greeting (READY); contents are ignored.
    match timeout(config.io_timeout, lines.next_line()).await {
        Ok(Ok(_)) => {}
        _ => return false,
    }

    if write_half
        .write_all(format!("{HEALTH_PING}\n").as_bytes())
        .await
        .is_err()
    {
        return false;
    }

    match timeout(config.io_timeout, lines.next_line()).await {
        Ok(Ok(Some(reply))) => reply.trim().eq_ignore_ascii_case(HEALTH_PONG),
        _ => false,
    }
}

fn split_host_port(peer: &str) -> Option<(&str, u16)> {
    let (host, port) = peer.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
