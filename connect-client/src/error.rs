use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not connected to the relay")]
    NotConnected,
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),
    #[error("connection failed: {0}")]
    Transport(String),
}
