use thiserror::Error;

/// Error taxonomy for the workspace execution layer.
///
/// A missing terminal is not an error: operations report it through their
/// result structs so the adapter never has to translate an exception into a
/// user-visible failure. The variants here cover what genuinely went wrong on
/// the host side; the adapter converts them into a `{success, message}` shape.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    /// The OS refused process creation. The raw detail stays in the field for
    /// logs; callers only ever see the generic message.
    #[error("Failed to create terminal session due to an internal error.")]
    SpawnFailure(String),

    /// A termination signal was rejected while the process was still alive.
    #[error("Failed to kill terminal process. Please try again later.")]
    SignalFailure(String),

    /// Cgroup or rlimit attachment failed. Logged and swallowed at call sites;
    /// never surfaced across the operation boundary.
    #[error("Resource control error: {0}")]
    ResourceControl(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    /// A one-shot command ran to completion but exited nonzero. Carries the
    /// process's stderr text.
    #[error("{0}")]
    CommandFailed(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl AppError {
    /// Detail suitable for logging, including internals the user-visible
    /// Display representation deliberately omits.
    pub fn internal_detail(&self) -> String {
        match self {
            AppError::SpawnFailure(detail) | AppError::SignalFailure(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}
