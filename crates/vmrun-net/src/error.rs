use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("filter helper not found: {0}")]
    HelperNotFound(String),

    #[error("filter helper exited before the data plane socket was ready")]
    HelperExitedEarly,

    #[error("Connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
