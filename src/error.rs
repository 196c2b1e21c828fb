//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.
//!
//! Failures fall into four groups:
//!
//! - Precondition violations (malformed inputs, bad output locations) are
//!   reported synchronously, before any lock is taken.
//! - Storage faults (`Io`) are unexpected filesystem failures outside the
//!   caller's build action, including lock acquisition failures.
//! - Action failures wrap whatever error the caller's build action returned,
//!   so callers can uniformly unwrap the original cause.
//! - `Internal` marks a broken invariant inside Kiln itself, such as a
//!   create-if-absent action that did not create its file.
//!
//! Cache corruption is deliberately NOT an error: it is reported through
//! [`QueryResult`](crate::cache::QueryResult) and self-heals on the next
//! successful query.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Error type returned by caller-supplied build actions
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Inputs construction errors
    #[error("Input parameter '{0}' already exists")]
    DuplicateInputName(String),

    #[error("Input parameter name '{0}' must not contain '=' or line breaks")]
    InvalidInputName(String),

    #[error("Value of input parameter '{0}' must not contain line breaks")]
    InvalidInputValue(String),

    #[error("Inputs must contain at least one parameter in addition to the command")]
    EmptyInputs,

    // Output location errors
    #[error("Output directory must not be the same as the cache directory '{0}'")]
    OutputSameAsCacheDir(PathBuf),

    #[error("Output directory '{output}' must not be located inside the cache directory '{cache_dir}'")]
    OutputInsideCacheDir { output: PathBuf, cache_dir: PathBuf },

    #[error("Output directory '{output}' must not contain the cache directory '{cache_dir}'")]
    OutputContainsCacheDir { output: PathBuf, cache_dir: PathBuf },

    // Lock coordination errors
    #[error("Parent directory of '{0}' does not exist, cannot create lock file")]
    LockFileParentMissing(PathBuf),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Build action errors
    #[error("Build action failed")]
    Action {
        #[source]
        source: ActionError,
    },

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a failure returned by a caller-supplied build action
    pub fn action(source: ActionError) -> Self {
        Self::Action { source }
    }

    /// Check whether this error originated in a caller-supplied action
    pub fn is_action_failure(&self) -> bool {
        matches!(self, Self::Action { .. })
    }

    /// Unwrap the original cause of an action failure, if this is one
    pub fn into_action_cause(self) -> Option<ActionError> {
        match self {
            Self::Action { source } => Some(source),
            _ => None,
        }
    }
}
