use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{DedupIndex, ReplicaProfile, ReplicationError, Result};

const QUORUM_TIMEOUT: Duration = Duration::from_secs(2);

type Store = Arc<RwLock<HashMap<String, String>>>;

/// In-memory quorum replication for messages: writes and reads fan out to
/// N simulated replicas and succeed once a majority answers. A message
/// stabilizes into the primary store only after a write quorum is reached.
pub struct QuorumReplicator {
    total_nodes: usize,
    write_quorum: usize,
    read_quorum: usize,
    replicas: Vec<Store>,
    stabilized: Store,
    dedup: DedupIndex,
    profile: ReplicaProfile,
    dispatches: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl QuorumReplicator {
    pub fn new(total_nodes: usize) -> Result<Self> {
        Self::with_profile(total_nodes, ReplicaProfile::default())
    }

    pub fn with_profile(total_nodes: usize, profile: ReplicaProfile) -> Result<Self> {
        if total_nodes < 1 {
            return Err(ReplicationError::InvalidReplicaCount(total_nodes));
        }
        let quorum = total_nodes / 2 + 1;
        info!(
            write_quorum = quorum,
            read_quorum = quorum,
            total_nodes,
            "quorum replication configured"
        );
        Ok(Self {
            total_nodes,
            write_quorum: quorum,
            read_quorum: quorum,
            replicas: (0..total_nodes)
                .map(|_| Arc::new(RwLock::new(HashMap::new())))
                .collect(),
            stabilized: Arc::new(RwLock::new(HashMap::new())),
            dedup: DedupIndex::new(),
            profile,
            dispatches: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Quorum write: true once at least `write_quorum` replicas ack within
    /// the deadline. A repeated id is an idempotent accept with no replica
    /// dispatches.
    pub async fn write_message(&self, message_id: &str, content: &str) -> bool {
        if message_id.trim().is_empty() {
            warn!("rejected write with blank message id");
            return false;
        }
        if self.dedup.contains(message_id).await {
            info!(message = short_id(message_id), "duplicate message, skipping write");
            return true;
        }

        debug!(
            message = short_id(message_id),
            quorum = self.write_quorum,
            "replicating message"
        );

        let (tx, mut rx) = mpsc::channel(self.total_nodes);
        for replica in &self.replicas {
            self.dispatches.fetch_add(1, Ordering::Relaxed);
            let replica = replica.clone();
            let closed = self.closed.clone();
            let profile = self.profile.clone();
            let id = message_id.to_string();
            let content = content.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let ack = write_to_replica(&replica, &closed, &profile, id, content).await;
                let _ = tx.send(ack).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + QUORUM_TIMEOUT;
        let mut acks = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(true)) => {
                    acks += 1;
                    if acks >= self.write_quorum {
                        break;
                    }
                }
                Ok(Some(false)) => {}
                // All replicas answered or the deadline passed.
                Ok(None) | Err(_) => break,
            }
        }

        if acks >= self.write_quorum {
            self.stabilized
                .write()
                .await
                .insert(message_id.to_string(), content.to_string());
            self.dedup.record(message_id).await;
            info!(
                message = short_id(message_id),
                acks,
                total = self.total_nodes,
                "write reached quorum"
            );
            true
        } else {
            warn!(
                message = short_id(message_id),
                acks,
                required = self.write_quorum,
                "write failed to reach quorum"
            );
            false
        }
    }

    /// Quorum read: the most frequent non-null value among at least
    /// `read_quorum` replica responses, or None without a quorum.
    pub async fn read_message(&self, message_id: &str) -> Option<String> {
        if message_id.trim().is_empty() {
            return None;
        }

        debug!(
            message = short_id(message_id),
            quorum = self.read_quorum,
            "reading message"
        );

        let (tx, mut rx) = mpsc::channel(self.total_nodes);
        for replica in &self.replicas {
            self.dispatches.fetch_add(1, Ordering::Relaxed);
            let replica = replica.clone();
            let stabilized = self.stabilized.clone();
            let closed = self.closed.clone();
            let profile = self.profile.clone();
            let id = message_id.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let value = read_from_replica(&replica, &stabilized, &closed, &profile, &id).await;
                let _ = tx.send(value).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + QUORUM_TIMEOUT;
        let mut responses = Vec::with_capacity(self.total_nodes);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Some(value))) => {
                    responses.push(value);
                    if responses.len() >= self.read_quorum {
                        break;
                    }
                }
                Ok(Some(None)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if responses.len() >= self.read_quorum {
            info!(
                message = short_id(message_id),
                responses = responses.len(),
                total = self.total_nodes,
                "read reached quorum"
            );
            resolve_plurality(&responses)
        } else {
            warn!(
                message = short_id(message_id),
                responses = responses.len(),
                required = self.read_quorum,
                "read failed to reach quorum"
            );
            None
        }
    }

    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    pub fn read_quorum(&self) -> usize {
        self.read_quorum
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// Number of keys in the stabilized store.
    pub async fn stabilized_count(&self) -> usize {
        self.stabilized.read().await.len()
    }

    /// Total simulated replica operations dispatched so far.
    pub fn replica_dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    /// In-flight dispatches observe the flag and abandon their work.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) async fn clear_replica(&self, index: usize) {
        self.replicas[index].write().await.clear();
    }
}

async fn write_to_replica(
    replica: &Store,
    closed: &AtomicBool,
    profile: &ReplicaProfile,
    message_id: String,
    content: String,
) -> bool {
    sleep_jitter(profile.write_delay_ms).await;
    if closed.load(Ordering::Relaxed) || chance(profile.write_failure_rate) {
        return false;
    }
    // A key, once set on a replica, keeps its first value.
    replica.write().await.entry(message_id).or_insert(content);
    true
}

async fn read_from_replica(
    replica: &Store,
    stabilized: &Store,
    closed: &AtomicBool,
    profile: &ReplicaProfile,
    message_id: &str,
) -> Option<String> {
    sleep_jitter(profile.read_delay_ms).await;
    if closed.load(Ordering::Relaxed) || chance(profile.read_miss_rate) {
        return None;
    }
    let value = replica.read().await.get(message_id).cloned();
    match value {
        Some(value) => Some(value),
        // A lagging replica answers from the stabilized store (eventual).
        None => stabilized.read().await.get(message_id).cloned(),
    }
}

async fn sleep_jitter((low, high): (u64, u64)) {
    let delay = rand::thread_rng().gen_range(low..=high);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

fn chance(probability: f64) -> bool {
    probability > 0.0 && rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
}

/// Most frequent value; ties keep the value that reached the count first.
fn resolve_plurality(values: &[String]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut best: Option<(&str, usize)> = None;
    for value in values {
        let count = counts
            .entry(value.as_str())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;
        if best.map_or(true, |(_, existing)| count > existing) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}
