use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rdma device not found: {0}")]
    DeviceNotFound(String),
    #[error("no active port on rdma device: {0}")]
    NoActivePort(String),
    #[error("connection is not established")]
    NotConnected,
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("connector protocol violation: {0}")]
    Protocol(&'static str),
    #[error("verbs backend error: {0}")]
    Backend(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Wraps a failed raw verbs call that reported an errno return value.
    pub(crate) fn verbs(op: &'static str, errno: i32) -> Self {
        TransportError::Backend(format!(
            "{op} failed: {}",
            io::Error::from_raw_os_error(errno)
        ))
    }

    /// Wraps a failed raw verbs call that reported failure through errno.
    pub(crate) fn verbs_os(op: &'static str) -> Self {
        TransportError::Backend(format!("{op} failed: {}", io::Error::last_os_error()))
    }
}
