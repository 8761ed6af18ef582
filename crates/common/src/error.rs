//! Error types for trpc

use thiserror::Error;

use crate::syntax::Position;
use crate::value::ResolveError;

/// Result type alias using the trpc Error
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for operational failures (I/O, dial, transport)
pub const EXIT_OPERATIONAL: i32 = 1;
/// Exit code for specification and usage errors
pub const EXIT_SPECIFICATION: i32 = 2;
/// Exit code for a Panic-severity test failure
pub const EXIT_TEST_FAILED: i32 = 3;
/// Base added to the RPC status code when status exit codes are requested
pub const EXIT_STATUS_OFFSET: i32 = 64;

/// trpc error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Syntax { message: String, pos: Position },

    #[error("Duplicate invoke name {name} in {pos} which defined at {first}")]
    DuplicateInvoke { name: String, pos: Position, first: Position },

    #[error("Endpoint \"{endpoint}\" not found for Invoke \"{invoke}\"\nKnown endpoints:\n{}", .known.join("\n"))]
    UnknownEndpoint {
        invoke: String,
        endpoint: String,
        known: Vec<String>,
        pos: Position,
    },

    #[error("{source}")]
    Resolve {
        #[source]
        source: ResolveError,
        pos: Position,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to resolve schema: {0}")]
    Schema(String),

    #[error("Failed to dial target host \"{target}\": {reason}")]
    Dial { target: String, reason: String },

    #[error("Error invoking method \"{symbol}\": {reason}")]
    Transport { symbol: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn syntax(pos: &Position, message: impl Into<String>) -> Self {
        Error::Syntax { message: message.into(), pos: pos.clone() }
    }

    /// Process exit code this error maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Syntax { .. }
            | Error::DuplicateInvoke { .. }
            | Error::UnknownEndpoint { .. }
            | Error::Resolve { .. }
            | Error::InvalidConfig(_) => EXIT_SPECIFICATION,
            Error::Schema(_) | Error::Dial { .. } | Error::Transport { .. } | Error::Io(_) => EXIT_OPERATIONAL,
        }
    }

    /// Source location the error points at, if any
    pub fn position(&self) -> Option<&Position> {
        match self {
            Error::Syntax { pos, .. }
            | Error::DuplicateInvoke { pos, .. }
            | Error::UnknownEndpoint { pos, .. }
            | Error::Resolve { pos, .. } => Some(pos),
            _ => None,
        }
    }
}
