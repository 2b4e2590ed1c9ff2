use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use camino::Utf8PathBuf;
use thiserror::Error;

use crate::id::TaskId;

/// A value reachable from a persisted record cannot be represented in the
/// object-graph format.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("value of runtime type '{0}' cannot be represented in a persisted record")]
    Unserializable(&'static str),

    #[error("failed to write persisted record.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode persisted record.\n{0}")]
    Wire(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read persisted record.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse persisted record.\n{0}")]
    Wire(#[from] ciborium::de::Error<std::io::Error>),

    #[error("unsupported record format version {0}")]
    Version(u16),

    #[error("persisted record is corrupt, the body does not match its digest")]
    Digest,

    #[error("persisted record references unknown object slot {0}")]
    UnknownSlot(u32),

    #[error("persisted record contains a reference cycle through object slot {0}")]
    SlotCycle(u32),

    #[error("no type named '{0}' in the current resolution context")]
    UnknownType(Box<str>),

    #[error("no interface named '{0}' in the current resolution context")]
    UnknownInterface(Box<str>),

    #[error("proxy record with an empty interface list")]
    EmptyProxy,

    #[error("record does not match the shape of type '{0}': {1}")]
    Shape(Box<str>, String),

    #[error("malformed task record: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum FreezeError {
    #[error("task '{id}' is already persisted at '{path}'")]
    AlreadyPersisted { id: TaskId, path: Utf8PathBuf },

    #[error("task '{id}' could not be serialized.\n{source}")]
    Encode { id: TaskId, source: EncodeError },

    #[error("failed to write '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// The outcome of a single evaluation request. Cached and shared between
/// dependents, hence the cheap `Arc` clones inside.
#[derive(Debug, Error, Clone)]
pub enum EvalError {
    /// Sentinel: the task was persisted instead of executed. Not a genuine
    /// runtime failure.
    #[error("task '{0}' was persisted, not executed")]
    Persisted(TaskId),

    #[error("{0}")]
    Freeze(Arc<FreezeError>),

    #[error("operation '{0}' is not registered in the current resolution context")]
    UnknownOp(Box<str>),

    #[error("task '{id}' failed.\n{cause}")]
    Task {
        id: TaskId,
        cause: Arc<anyhow::Error>,
    },
}

impl EvalError {
    /// Whether this is the "frozen, not run" sentinel rather than a genuine
    /// failure.
    pub fn is_persisted(&self) -> bool {
        matches!(self, EvalError::Persisted(_))
    }
}

impl From<FreezeError> for EvalError {
    fn from(e: FreezeError) -> Self {
        EvalError::Freeze(Arc::new(e))
    }
}
