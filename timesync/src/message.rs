use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vector_clock::VectorClock;
use crate::{Result, TimeSyncError};

/// Message envelope carried through replication and sequencing.
/// Identity fields are fixed at construction; timestamps are overwritten
/// by the time service during ingestion and ordering correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: String,
    sender: String,
    receiver: String,
    content: String,
    physical_ts: i64,
    logical_ts: u64,
    vector_clock: Option<VectorClock>,
}

impl Message {
    pub fn new(sender: &str, receiver: &str, content: &str) -> Result<Self> {
        Self::with_parts(
            None,
            sender,
            receiver,
            content,
            Utc::now().timestamp_millis(),
            0,
            None,
        )
    }

    /// Full constructor. A blank `id` gets a fresh UUID; a non-positive
    /// physical timestamp falls back to the wall clock.
    pub fn with_parts(
        id: Option<&str>,
        sender: &str,
        receiver: &str,
        content: &str,
        physical_ts: i64,
        logical_ts: u64,
        vector_clock: Option<VectorClock>,
    ) -> Result<Self> {
        let id = match id {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        Ok(Self {
            id,
            sender: non_empty(sender, "sender")?,
            receiver: non_empty(receiver, "receiver")?,
            content: non_empty(content, "content")?,
            physical_ts: positive_or_now(physical_ts),
            logical_ts,
            vector_clock,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn physical_ts(&self) -> i64 {
        self.physical_ts
    }

    pub fn logical_ts(&self) -> u64 {
        self.logical_ts
    }

    pub fn set_physical_ts(&mut self, ts: i64) {
        self.physical_ts = positive_or_now(ts);
    }

    pub fn set_logical_ts(&mut self, ts: u64) {
        self.logical_ts = ts;
    }

    pub fn vector_clock(&self) -> Option<&VectorClock> {
        self.vector_clock.as_ref()
    }

    /// Lazily materializes an empty clock so callers always get one.
    pub fn vector_clock_mut(&mut self) -> &mut VectorClock {
        self.vector_clock.get_or_insert_with(VectorClock::new)
    }

    pub fn set_vector_clock(&mut self, clock: Option<VectorClock>) {
        self.vector_clock = clock;
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TimeSyncError::EmptyField(field));
    }
    Ok(trimmed.to_string())
}

fn positive_or_now(ts: i64) -> i64 {
    if ts > 0 {
        ts
    } else {
        Utc::now().timestamp_millis()
    }
}

// Equality is by id only; the id uniquely identifies the message.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[{}: {} -> {}: {}]",
            self.short_id(),
            self.sender,
            self.receiver,
            self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_stamps_id_and_wall_clock() {
        let m = Message::new("alice", "bob", "hi").unwrap();
        assert!(!m.id().is_empty());
        assert!(m.physical_ts() > 0);
        assert_eq!(m.logical_ts(), 0);
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(Message::new("", "bob", "hi").is_err());
        assert!(Message::new("alice", "  ", "hi").is_err());
        assert!(Message::new("alice", "bob", "").is_err());
    }

    #[test]
    fn trims_identity_fields() {
        let m = Message::new(" alice ", "bob", "  hi there ").unwrap();
        assert_eq!(m.sender(), "alice");
        assert_eq!(m.content(), "hi there");
    }

    #[test]
    fn blank_id_gets_replaced() {
        let m = Message::with_parts(Some("  "), "a", "b", "c", 1, 0, None).unwrap();
        assert!(!m.id().trim().is_empty());
    }

    #[test]
    fn equality_is_by_id() {
        let a = Message::with_parts(Some("m-1"), "a", "b", "x", 1, 1, None).unwrap();
        let b = Message::with_parts(Some("m-1"), "c", "d", "y", 2, 2, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_positive_timestamp_falls_back_to_now() {
        let mut m = Message::new("a", "b", "c").unwrap();
        m.set_physical_ts(0);
        assert!(m.physical_ts() > 0);
    }

    #[test]
    fn vector_clock_is_materialized_on_demand() {
        let mut m = Message::new("a", "b", "c").unwrap();
        assert!(m.vector_clock().is_none());
        m.vector_clock_mut().increment("a");
        assert_eq!(m.vector_clock().map(|c| c.get("a")), Some(1));
    }
}
