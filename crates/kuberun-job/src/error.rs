//! Errors raised while submitting and supervising runs

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a run ended unsuccessfully.
///
/// Stored on the [`Run`](crate::run::Run) when first detected and re-raised by
/// every later poll, so it must stay cheap to clone.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RunFailure {
    /// One or more pods reached a failed phase
    #[error("run {run} failed: pods [{}] did not succeed; see {} for their output", .failed.join(", "), .output.display())]
    Workload {
        /// Run identifier
        run: String,
        /// Names of the failed pods
        failed: Vec<String>,
        /// Output file holding the dumped pod logs
        output: PathBuf,
    },

    /// The run exceeded its time limit
    #[error("run {run} timed out ({:.6}s > {}s)", .elapsed.as_secs_f64(), .limit.as_secs_f64())]
    Timeout {
        /// Run identifier
        run: String,
        /// Time since submission when the limit was detected
        elapsed: Duration,
        /// The configured limit
        limit: Duration,
    },
}

/// Errors from the run controller
#[derive(Debug, Error)]
pub enum RunError {
    /// The descriptor or run settings can never succeed as given
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// The orchestrator rejected the submission for a non-quota reason
    #[error("submission of {name} rejected: {message}")]
    Rejected {
        /// Name of the object being created
        name: String,
        /// Rejection reason reported by the orchestrator
        message: String,
    },

    /// The run failed or timed out
    #[error(transparent)]
    Failed(#[from] RunFailure),

    /// Errors from the shared layer (API calls, IO, documents)
    #[error(transparent)]
    Common(#[from] kuberun_common::Error),
}

impl RunError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a rejection error
    pub fn rejected(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rejected {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// The run failure carried by this error, if any
    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
