use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-message causal clock: one non-negative counter per node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

/// Outcome of comparing two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    Concurrent,
    After,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, u64>) -> Self {
        Self { entries }
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.entries.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Element-wise max merge of a remote clock into this one.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, remote) in &other.entries {
            let local = self.entries.entry(node_id.clone()).or_insert(0);
            if *remote > *local {
                *local = *remote;
            }
        }
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> &BTreeMap<String, u64> {
        &self.entries
    }

    /// Wire form: `key:value;key:value`. Empty clock serializes to "".
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (node_id, value) in &self.entries {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(node_id);
            out.push(':');
            out.push_str(&value.to_string());
        }
        out
    }

    /// Parses the wire form back into a map. Malformed entries are dropped.
    pub fn parse(data: &str) -> BTreeMap<String, u64> {
        let mut entries = BTreeMap::new();
        if data.is_empty() {
            return entries;
        }
        for pair in data.split(';') {
            let Some((node_id, value)) = pair.split_once(':') else {
                continue;
            };
            if let Ok(value) = value.trim().parse::<u64>() {
                entries.insert(node_id.trim().to_string(), value);
            }
        }
        entries
    }

    /// Compares over the union of keys; missing entries count as zero.
    pub fn causality(&self, other: &VectorClock) -> CausalOrder {
        let mut greater = false;
        let mut less = false;

        for node_id in self.entries.keys().chain(other.entries.keys()) {
            let ours = self.get(node_id);
            let theirs = other.get(node_id);
            if ours > theirs {
                greater = true;
            } else if ours < theirs {
                less = true;
            }
        }

        match (greater, less) {
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            _ => CausalOrder::Concurrent,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_entries() {
        let mut clock = VectorClock::new();
        clock.increment("node-1");
        clock.increment("node-1");
        clock.increment("node-2");
        let parsed = VectorClock::parse(&clock.serialize());
        assert_eq!(&parsed, clock.entries());
    }

    #[test]
    fn empty_string_is_empty_clock() {
        assert!(VectorClock::parse("").is_empty());
        assert_eq!(VectorClock::new().serialize(), "");
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let parsed = VectorClock::parse("a:1;garbage;b:x;c:3");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("a"), Some(&1));
        assert_eq!(parsed.get("c"), Some(&3));
    }

    #[test]
    fn merge_takes_element_wise_max() {
        let mut a = VectorClock::from_entries(
            [("n1".to_string(), 3), ("n2".to_string(), 1)].into_iter().collect(),
        );
        let b = VectorClock::from_entries(
            [("n1".to_string(), 2), ("n3".to_string(), 5)].into_iter().collect(),
        );
        a.merge(&b);
        assert_eq!(a.get("n1"), 3);
        assert_eq!(a.get("n2"), 1);
        assert_eq!(a.get("n3"), 5);
    }

    #[test]
    fn strict_dominance_compares_after() {
        let a = VectorClock::from_entries(
            [("n1".to_string(), 2), ("n2".to_string(), 2)].into_iter().collect(),
        );
        let b = VectorClock::from_entries(
            [("n1".to_string(), 1), ("n2".to_string(), 2)].into_iter().collect(),
        );
        assert_eq!(a.causality(&b), CausalOrder::After);
        assert_eq!(b.causality(&a), CausalOrder::Before);
    }

    #[test]
    fn mixed_components_are_concurrent() {
        let a = VectorClock::from_entries([("n1".to_string(), 2)].into_iter().collect());
        let b = VectorClock::from_entries([("n2".to_string(), 1)].into_iter().collect());
        assert_eq!(a.causality(&b), CausalOrder::Concurrent);
        assert_eq!(a.causality(&a.clone()), CausalOrder::Concurrent);
    }
}
