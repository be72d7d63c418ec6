mod coordinator;
mod registry;

pub use coordinator::Coordinator;
pub use registry::{CreateMode, Registry, Session, SessionEvent, SessionId};

// Layout under the coordination service.
pub const ROOT_PATH: &str = "/messaging-system";
pub const NODES_PATH: &str = "/messaging-system/nodes";
pub const LEADER_PATH: &str = "/messaging-system/leader";
pub const MESSAGES_PATH: &str = "/messaging-system/messages";
pub const CONFIG_PATH: &str = "/messaging-system/config";

pub type Result<T> = std::result::Result<T, CoordinationError>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("session expired")]
    SessionExpired,

    #[error("not connected to the coordination service")]
    NotConnected,
}
