//! Error types shared by the pipeline, the front end and the binaries.
//!
//! Runtime conditions (bad config, failed bind, closed peer) are `Result`s.
//! Programming defects inside stage code are not: they go through
//! `invariant_violation!` and stop the process.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Registry status, mirroring the three outcomes of `init()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InitFail,
    ParseFail,
}

impl Status {
    pub fn of<T>(result: &Result<T, PipelineError>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed pool or stage definitions (PARSEFAIL).
    #[error("pipeline config parse failed: {0}")]
    Parse(String),

    /// Instantiation or startup failed; nothing was left running (INITFAIL).
    #[error("pipeline init failed: {0}")]
    Init(String),

    /// Operation called in the wrong registry lifecycle state.
    #[error("registry is {actual}, expected {expected}")]
    State {
        expected: &'static str,
        actual: &'static str,
    },
}

impl PipelineError {
    pub fn status(&self) -> Status {
        match self {
            PipelineError::Parse(_) => Status::ParseFail,
            PipelineError::Init(_) | PipelineError::State { .. } => Status::InitFail,
        }
    }
}

/// Raised by stage constructors and `Stage::initialize`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}' requires a downstream stage")]
    MissingDownstream { stage: String },

    #[error("stage '{stage}': downstream stage '{next}' is not defined")]
    UnknownDownstream { stage: String, next: String },

    #[error("stage '{stage}': {reason}")]
    Rejected { stage: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("[server] {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket setup failed ({op}): {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("reactor unavailable: {0}")]
    Reactor(#[source] io::Error),

    #[error("reactor I/O failure: {0}")]
    Io(#[from] io::Error),
}

/// A response could not be handed to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection {0} is closed")]
    Closed(u64),
}

/// Why a producer did not get an outcome from its ticket.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("event was dropped before reaching a terminal state")]
    Dropped,

    #[error("timed out waiting for the event outcome")]
    Timeout,
}

/// Raised by a [`crate::session::KvAccessor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    NotFound,

    #[error("no database selected")]
    NoDatabase,

    #[error("storage backend: {0}")]
    Backend(String),
}
