use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use tracing::info;

use crate::message::Message;

/// Delivers messages per conversation in strictly increasing logical-time
/// order with no gaps. A missing sequence number blocks its conversation
/// until filled.
pub struct Sequencer {
    conversations: Mutex<HashMap<String, Conversation>>,
}

#[derive(Default)]
struct Conversation {
    queue: BinaryHeap<Reverse<Pending>>,
    last_delivered: u64,
}

struct Pending {
    sequence: u64,
    message: Message,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a message and return everything that became deliverable,
    /// in delivery order.
    pub fn queue_message(&self, message: Message) -> Vec<Message> {
        let conversation = conversation_id(message.sender(), message.receiver());
        let sequence = message.logical_ts();

        let mut conversations = match self.conversations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = conversations.entry(conversation).or_default();
        state.queue.push(Reverse(Pending { sequence, message }));

        let mut delivered = Vec::new();
        loop {
            let ready = matches!(
                state.queue.peek(),
                Some(Reverse(head)) if head.sequence == state.last_delivered + 1
            );
            if !ready {
                break;
            }
            if let Some(Reverse(next)) = state.queue.pop() {
                state.last_delivered = next.sequence;
                info!(
                    sequence = next.sequence,
                    sender = %next.message.sender(),
                    receiver = %next.message.receiver(),
                    content = %next.message.content(),
                    "delivered message"
                );
                delivered.push(next.message);
            }
        }
        delivered
    }

    /// Number of messages still waiting in a conversation's queue.
    pub fn pending(&self, conversation: &str) -> usize {
        let conversations = match self.conversations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        conversations
            .get(conversation)
            .map(|state| state.queue.len())
            .unwrap_or(0)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Both directions of a participant pair share one conversation.
pub fn conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}-{b}")
    } else {
        format!("{b}-{a}")
    }
}

/// Sorts a message batch by logical timestamp, for offline reconciliation.
pub fn reorder_messages(messages: &mut [Message]) {
    messages.sort_by_key(Message::logical_ts);
    info!(count = messages.len(), "reordered messages by logical timestamp");
}

// Heap ordering is by sequence alone.
impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}
