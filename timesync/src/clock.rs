use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::message::Message;

/// Max tolerated skew before a warning is emitted.
const MAX_CLOCK_SKEW_MS: i64 = 1_000;

/// Hybrid clock: a physical offset averaged from peers plus a monotone
/// logical counter merged on receive.
pub struct HybridClock {
    /// Average offset from peers (ms), applied to the wall clock.
    clock_offset: AtomicI64,
    /// Increases on every local event, send, and receive.
    logical: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            clock_offset: AtomicI64::new(0),
            logical: AtomicU64::new(0),
        }
    }

    /// Best-effort sync: query each peer's time and average the offsets.
    /// Peer responses are simulated in-process; with no peers the offset
    /// is left unchanged.
    pub async fn synchronize_clocks(&self, peers: &[String]) {
        if peers.is_empty() {
            info!("no peers for clock synchronization, using system time");
            return;
        }

        info!(peers = peers.len(), "synchronizing clock with peers");

        let mut total_offset: i64 = 0;
        let mut responders = 0;

        for peer in peers {
            let remote = simulate_peer_time_request().await;
            let local = Utc::now().timestamp_millis();
            let offset = remote - local;
            total_offset += offset;
            responders += 1;
            debug!(%peer, offset_ms = offset, "peer clock offset");
        }

        if responders > 0 {
            let average = total_offset / responders;
            self.clock_offset.store(average, Ordering::Relaxed);
            info!(offset_ms = average, "clock synchronized");
        } else {
            warn!("could not synchronize with any peers");
        }
    }

    /// Physical time adjusted by the current offset.
    pub fn current_timestamp(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset.load(Ordering::Relaxed)
    }

    /// Next logical counter value; strictly increasing across calls.
    pub fn next_logical_time(&self) -> u64 {
        self.logical.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn logical_time(&self) -> u64 {
        self.logical.load(Ordering::SeqCst)
    }

    pub fn clock_offset(&self) -> i64 {
        self.clock_offset.load(Ordering::Relaxed)
    }

    /// Merge rule for an incoming `(physical, logical)` pair:
    /// `logical <- max(logical, remote) + 1`.
    pub fn on_receive(&self, remote_physical_ts: i64, remote_logical_ts: u64) {
        let local_physical = self.current_timestamp();
        if remote_physical_ts > local_physical {
            debug!(
                remote = remote_physical_ts,
                local = local_physical,
                "remote physical clock is ahead"
            );
        }
        let _ = self
            .logical
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote_logical_ts) + 1)
            });
    }

    /// True when the remote timestamp deviates beyond the allowed limit.
    pub fn detect_skew(&self, remote_ts: i64, source: &str) -> bool {
        let skew = (self.current_timestamp() - remote_ts).abs();
        if skew > MAX_CLOCK_SKEW_MS {
            warn!(%source, skew_ms = skew, "clock skew detected");
            return true;
        }
        false
    }

    /// Overwrite a message's physical timestamp after skew detection or
    /// ordering fixes.
    pub fn correct_timestamp(&self, message: &mut Message, corrected_ts: i64) {
        let previous = message.physical_ts();
        message.set_physical_ts(corrected_ts);
        info!(
            message = message.short_id(),
            from = previous,
            to = message.physical_ts(),
            "corrected message timestamp"
        );
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Demo-only stand-in for a peer time query: a short network delay and a
/// reply within +/-100ms of the local clock.
async fn simulate_peer_time_request() -> i64 {
    let (delay_ms, skew_ms) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(10..=60u64), rng.gen_range(-100..=100i64))
    };
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Utc::now().timestamp_millis() + skew_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_time_is_strictly_increasing() {
        let clock = HybridClock::new();
        let mut previous = 0;
        for _ in 0..100 {
            let next = clock.next_logical_time();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn receive_advances_past_remote_logical_time() {
        let clock = HybridClock::new();
        clock.on_receive(1, 50);
        assert!(clock.next_logical_time() > 50);
    }

    #[test]
    fn receive_from_lagging_remote_still_ticks() {
        let clock = HybridClock::new();
        clock.next_logical_time();
        clock.next_logical_time();
        let before = clock.logical_time();
        clock.on_receive(1, 0);
        assert_eq!(clock.logical_time(), before + 1);
    }

    #[test]
    fn skew_detection_uses_threshold() {
        let clock = HybridClock::new();
        let now = clock.current_timestamp();
        assert!(clock.detect_skew(now + MAX_CLOCK_SKEW_MS + 500, "node-2"));
        assert!(!clock.detect_skew(now + 10, "node-2"));
    }

    #[test]
    fn timestamp_correction_overwrites_physical_time() {
        let clock = HybridClock::new();
        let mut message = Message::new("a", "b", "c").unwrap();
        clock.correct_timestamp(&mut message, 42);
        assert_eq!(message.physical_ts(), 42);
    }

    #[tokio::test]
    async fn synchronization_bounds_the_offset() {
        let clock = HybridClock::new();
        let peers = vec!["127.0.0.1:7201".to_string(), "127.0.0.1:7202".to_string()];
        clock.synchronize_clocks(&peers).await;
        // Simulated peers answer within +/-100ms of local time.
        assert!(clock.clock_offset().abs() <= 150);
    }

    #[tokio::test]
    async fn synchronization_without_peers_is_a_no_op() {
        let clock = HybridClock::new();
        clock.synchronize_clocks(&[]).await;
        assert_eq!(clock.clock_offset(), 0);
    }
}
