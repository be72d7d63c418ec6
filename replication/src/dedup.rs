use std::collections::HashSet;

use tokio::sync::RwLock;

/// Tracks replicated message ids so repeated writes become idempotent
/// accepts. Grows monotonically during a run.
pub struct DedupIndex {
    seen: RwLock<HashSet<String>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashSet::new()),
        }
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.seen.read().await.contains(message_id)
    }

    /// Returns false when the id was already recorded.
    pub async fn record(&self, message_id: &str) -> bool {
        self.seen.write().await.insert(message_id.to_string())
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }

    /// Clears all tracked ids. For tests only.
    pub async fn reset(&self) {
        self.seen.write().await.clear();
    }
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new()
    }
}
