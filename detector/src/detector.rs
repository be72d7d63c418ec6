use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::probe::probe_peer;
use crate::{Config, DetectorError, FailureListener, LogListener, Result};

/// Periodically probes peers over the transport port and emits debounced
/// UP/DOWN events, only on state transitions. A single worker task probes
/// all peers sequentially, so listener invocations are serialized.
pub struct FailureDetector {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    peers: RwLock<Vec<String>>,
    health: Mutex<HashMap<String, PeerHealth>>,
    listener: RwLock<Arc<dyn FailureListener>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Down,
    Up,
}

/// Per-peer debounce state. Peers start as up.
pub(crate) struct PeerHealth {
    is_up: bool,
    fail_streak: u32,
    ok_streak: u32,
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self {
            is_up: true,
            fail_streak: 0,
            ok_streak: 0,
        }
    }
}

impl PeerHealth {
    pub(crate) fn record(&mut self, reachable: bool, config: &Config) -> Option<Transition> {
        if reachable {
            self.ok_streak += 1;
            self.fail_streak = 0;
            if !self.is_up && self.ok_streak >= config.successes_to_mark_up {
                self.is_up = true;
                self.ok_streak = 0;
                return Some(Transition::Up);
            }
        } else {
            self.fail_streak += 1;
            self.ok_streak = 0;
            if self.is_up && self.fail_streak >= config.failures_to_mark_down {
                self.is_up = false;
                self.fail_streak = 0;
                return Some(Transition::Down);
            }
        }
        None
    }
}

impl FailureDetector {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                peers: RwLock::new(Vec::new()),
                health: Mutex::new(HashMap::new()),
                listener: RwLock::new(Arc::new(LogListener)),
            }),
            task: Mutex::new(None),
        }
    }

    /// Replaces the monitored peer set. Debounce state of peers that stay
    /// in the set is preserved.
    pub fn set_peers(&self, peers: Vec<String>) {
        {
            let mut health = lock(&self.inner.health);
            for peer in &peers {
                health.entry(peer.clone()).or_default();
            }
        }
        *write(&self.inner.peers) = peers;
    }

    pub fn set_listener(&self, listener: Arc<dyn FailureListener>) {
        *write(&self.inner.listener) = listener;
    }

    /// Current debounced view of a peer. Unknown peers count as up.
    pub fn is_up(&self, peer: &str) -> bool {
        lock(&self.inner.health)
            .get(peer)
            .map(|state| state.is_up)
            .unwrap_or(true)
    }

    pub fn start(&self) -> Result<()> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(DetectorError::AlreadyRunning);
        }

        let inner = self.inner.clone();
        info!(
            interval_secs = inner.config.check_interval.as_secs_f64(),
            "failure detection started"
        );
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.check_interval);
            loop {
                ticker.tick().await;
                inner.check_all().await;
            }
        }));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

impl Inner {
    async fn check_all(&self) {
        let peers = read(&self.peers).clone();
        for peer in peers {
            let reachable = probe_peer(&peer, &self.config).await;
            debug!(%peer, reachable, "probe result");

            let transition = lock(&self.health)
                .entry(peer.clone())
                .or_default()
                .record(reachable, &self.config);

            if let Some(transition) = transition {
                let listener = read(&self.listener).clone();
                match transition {
                    Transition::Down => listener.on_node_down(&peer),
                    Transition::Up => listener.on_node_up(&peer),
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
