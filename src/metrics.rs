use std::sync::Mutex;

use tracing::info;

/// Collects latency samples for messaging, replication, and leader
/// elections; summarized on shutdown.
pub struct SystemMetrics {
    inner: Mutex<Samples>,
}

#[derive(Default)]
struct Samples {
    message_delivery: Vec<u64>,
    replication: Vec<u64>,
    election: Vec<u64>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Samples::default()),
        }
    }

    pub fn record_message_delivery(&self, millis: u64) {
        self.lock().message_delivery.push(millis);
    }

    pub fn record_replication_latency(&self, millis: u64) {
        self.lock().replication.push(millis);
    }

    pub fn record_election_duration(&self, millis: u64) {
        self.lock().election.push(millis);
    }

    pub fn message_delivery_samples(&self) -> usize {
        self.lock().message_delivery.len()
    }

    pub fn log_summary(&self) {
        let samples = self.lock();
        info!(
            avg_delivery_ms = average(&samples.message_delivery),
            delivery_samples = samples.message_delivery.len(),
            avg_replication_ms = average(&samples.replication),
            replication_samples = samples.replication.len(),
            avg_election_ms = average(&samples.election),
            election_samples = samples.election.len(),
            "system metrics summary"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Samples> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn average(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}
