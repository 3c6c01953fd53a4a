use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a `MessageSource`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("malformed message {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("acknowledgement failed for message {id}: {reason}")]
    Acknowledge { id: String, reason: String },
}

/// Errors surfaced by a `Worker` when its execution terminates abnormally.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker for message {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("worker for message {id} failed (code={code:?}, signal={signal:?})")]
    Failed {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("worker for message {id} exceeded its maximum job duration")]
    TimedOut { id: String },

    #[error("lost track of worker for message {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("worker task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Acknowledge(#[from] QueueError),
}

/// Top-level error for building and running a `Watcher`.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("missing options: {field}")]
    Configuration { field: &'static str },

    #[error("invalid option {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    #[error("watcher is already listening")]
    AlreadyListening,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("failed to set permissions on {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WatchError {
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::Configuration { field }
    }
}
