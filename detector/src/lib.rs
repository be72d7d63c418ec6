mod detector;
mod probe;

pub use detector::FailureDetector;
pub use probe::probe_peer;

use std::time::Duration;

use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("detector already running")]
    AlreadyRunning,
}

/// Probe cadence and debounce thresholds.
#[derive(Debug, Clone)]
pub struct Config {
    pub check_interval: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    /// Consecutive misses before a peer is marked down.
    pub failures_to_mark_down: u32,
    /// Consecutive successes before a down peer is marked up.
    pub successes_to_mark_up: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(800),
            failures_to_mark_down: 3,
            successes_to_mark_up: 1,
        }
    }
}

/// Transition events for monitored peers. Defaults just log, so a
/// listener only overrides what it cares about.
pub trait FailureListener: Send + Sync {
    fn on_node_down(&self, peer: &str) {
        warn!(%peer, "node failure detected");
    }

    fn on_node_up(&self, peer: &str) {
        info!(%peer, "node recovered");
    }
}

/// Listener that keeps the default logging behavior.
pub struct LogListener;

impl FailureListener for LogListener {}
