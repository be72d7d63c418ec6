use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{InboundHandler, Result, TransportError, ACK, EXIT, PING, PONG, READY};

/// How long an idle connection may sit between lines.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented message server. On accept it greets with READY, answers
/// PING with PONG (health path), and hands every other line to the inbound
/// handler before replying ACK, until EOF or EXIT.
pub struct LineServer {
    handler: Arc<dyn InboundHandler>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl LineServer {
    pub fn new(handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            handler,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds and starts accepting. Port 0 picks a free port; the bound
    /// address is returned.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "server started");

        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, handler).await {
                                // Resets and aborts are routine probe fallout.
                                match e.kind() {
                                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {}
                                    _ => error!(%peer, error = %e, "error handling client"),
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "error accepting connection");
                        break;
                    }
                }
            }
        });

        *lock(&self.accept_task) = Some(task);
        *lock(&self.local_addr) = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.accept_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        if let Some(addr) = lock(&self.local_addr).take() {
            info!(%addr, "server stopped");
        }
    }
}

async fn handle_client(stream: TcpStream, handler: Arc<dyn InboundHandler>) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(format!("{READY}\n").as_bytes()).await?;

    loop {
        let line = match tokio::time::timeout(IDLE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            // EOF, read error, or idle connection: drop quietly.
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(PING) {
            write_half.write_all(format!("{PONG}\n").as_bytes()).await?;
            continue;
        }
        if trimmed == EXIT {
            break;
        }

        debug!(%peer, "received message line");
        handler.handle_line(line).await;
        write_half.write_all(format!("{ACK}\n").as_bytes()).await?;
    }

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
