pub mod config;
pub mod error;
pub mod metrics;
pub mod node;

pub use config::Config;
pub use error::{CourierError, Result};
pub use metrics::SystemMetrics;
pub use node::MessagingNode;

// Re-export key types from workspace crates
pub use coordination;
pub use detector;
pub use replication;
pub use timesync;
pub use transport;
