mod clock;
mod message;
mod sequencer;
mod vector_clock;

pub use clock::HybridClock;
pub use message::Message;
pub use sequencer::{conversation_id, reorder_messages, Sequencer};
pub use vector_clock::{CausalOrder, VectorClock};

pub type Result<T> = std::result::Result<T, TimeSyncError>;

#[derive(Debug, thiserror::Error)]
pub enum TimeSyncError {
    #[error("{0} cannot be empty")]
    EmptyField(&'static str),
}
