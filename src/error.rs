//! Error types for building and tearing down a chancacher.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::LockError;

/// Chancacher result type
pub type ChanCacherResult<T> = Result<T, ChanCacherError>;

/// Errors surfaced while constructing a chancacher.
///
/// Nothing in steady-state operation returns these; runtime encode and
/// decode failures are logged and the pipeline keeps moving.
#[derive(Debug, Error)]
pub enum ChanCacherError {
    #[error("cache path {0:?} is not a directory: invalid cache path")]
    InvalidCachePath(PathBuf),

    #[error("could not get file lock: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to quarantine {path:?}: {source}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ChanCacherError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
