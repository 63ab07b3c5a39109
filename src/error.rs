use thiserror::Error;

use crate::{frame::FrameId, row::RowAddress};

/// Every failure the frame layer can surface.
///
/// Running out of space in a frame is not an error; it is reported as
/// [`crate::InsertOutcome::NoSpace`].
#[derive(Error, Debug)]
pub enum FrameError {
    /// The byte image of a frame is inconsistent with its own header. The page is unusable.
    #[error("invalid frame {frame}: {detail}")]
    InvalidFrame { frame: FrameId, detail: String },

    /// A logic invariant of the engine was broken. Indicates a bug, never retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// The row stayed owned by a live foreign transaction across every retry.
    #[error("cannot access locked record {address}")]
    RecordLocked { address: RowAddress },

    /// The row's deletion is already committed.
    #[error("cannot access deleted record {address}")]
    RecordDeleted { address: RowAddress },

    #[error("no row at {address}")]
    NoSuchRow { address: RowAddress },

    /// A unique index already holds a visible entry for the key.
    #[error("unique index already holds key {key}")]
    DuplicateKey { key: String },

    /// The calling thread already holds a commit token.
    #[error("commit token already exists for this thread")]
    TokenAlreadyExists,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

impl FrameError {
    /// Whether retrying the whole top-level operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FrameError::RecordLocked { .. })
    }
}
