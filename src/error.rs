//! Error taxonomy for the data-plane engine.
//!
//! Every fallible operation in this crate returns [`Error`] rather than the
//! `bool`/out-param idiom the original implementation used; callers that
//! only need a success/failure signal (the block-device shim, see
//! [`crate::device`]) collapse `Result` to that at the boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("offset/size out of range: offset={offset} size={size} capacity={capacity}")]
    OutOfRange {
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("partition call failed: {0}")]
    IoError(String),

    #[error("partition call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("row {row} is unrecoverable: fewer than {required} of {total} cells are intact")]
    RowUnrecoverable {
        row: u64,
        required: u64,
        total: u64,
    },

    #[error("invalid volume configuration: {0}")]
    BadConfig(String),

    #[error("invalid codec parameters: {0}")]
    BadParams(String),

    #[error("insufficient blocks to decode row: have {have}, need {need}")]
    InsufficientBlocks { have: usize, need: usize },
}

impl Error {
    /// True for faults the caller should treat as "this cell looked missing",
    /// as opposed to faults that are fatal to the whole request.
    pub fn is_cell_local(&self) -> bool {
        matches!(self, Error::IoError(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
