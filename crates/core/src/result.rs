//! Core results and error types

use crate::address::VmAddress;
use crate::registers::RegisterPair;
use thiserror::Error;

/// Core error type encompassing all devirtualization errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The IR provider produced nothing for a handler. Aborts the whole run.
    #[error("IR lifting failed for handler at 0x{address:x}")]
    Pipeline {
        /// Native address of the first instruction of the offending node.
        address: u64,
    },

    /// No matcher accepted a handler while running in diagnostic mode.
    #[error("no handler pattern matched at {address}")]
    ClassificationFailure {
        /// Address of the unclassified handler occurrence.
        address: VmAddress,
    },

    /// The trace ran dry before the task reached a terminal state.
    #[error("trace exhausted after {steps} steps")]
    TraceExhausted {
        /// Number of steps the trace held.
        steps: usize,
    },

    /// The walker produced an empty node.
    #[error("empty node at trace index {index}")]
    EmptyNode {
        /// Cursor position in the trace.
        index: usize,
    },

    /// A handler implies a register pair that conflicts with the selected one.
    #[error("register mismatch: selected {selected}, derived {derived}")]
    RegisterMismatch {
        /// Pair selected for the current epoch.
        selected: RegisterPair,
        /// Pair implied by the handler.
        derived: RegisterPair,
    },

    /// The execution engine reported a failure.
    #[error("execution engine failed: {0}")]
    Engine(String),

    /// Block structure is malformed or inconsistent.
    #[error("invalid block structure: {0}")]
    InvalidBlockStructure(String),

    /// Failed to read file at the specified path.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path to the file that could not be read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write file at the specified path.
    #[error("could not write file '{path}': {source}")]
    FileWrite {
        /// The path to the file that could not be written.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Persisted cache or configuration could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The build configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns true when the error must abort the whole run instead of only the current task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Pipeline { .. })
    }
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
