use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("coordination error: {0}")]
    Coordination(#[from] coordination::CoordinationError),

    #[error("replication error: {0}")]
    Replication(#[from] replication::ReplicationError),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("detector error: {0}")]
    Detector(#[from] detector::DetectorError),

    #[error("invalid message: {0}")]
    Message(#[from] timesync::TimeSyncError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;
