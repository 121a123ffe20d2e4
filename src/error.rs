use thiserror::Error;

use crate::HandleId;

/// Errors surfaced by the handle table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// A node's slot array could not be allocated.
    #[error("out of memory while allocating a table node")]
    OutOfMemory,

    /// No object is registered under the handle.
    #[error("handle not found: {0}")]
    NotFound(HandleId),

    /// Malformed input (wire representation or configuration).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Every representable handle has already been issued.
    #[error("handle space exhausted")]
    Exhausted,
}

pub type Result<T> = std::result::Result<T, HandleError>;
