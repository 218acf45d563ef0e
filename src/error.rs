//! Error types for vmhost.

use std::time::Duration;

use crate::provision::ProvisionStage;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request field was missing or malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Every admission slot is taken. The caller should retry later.
    #[error("capacity exceeded: {max} active VM(s) allowed on this host")]
    CapacityExceeded {
        /// Configured ceiling.
        max: usize,
    },

    /// The VM id is already active or being provisioned.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A base image could not be downloaded.
    #[error("image '{image}' unavailable: {reason}")]
    ImageUnavailable {
        /// Image name.
        image: String,
        /// Why the download failed.
        reason: String,
    },

    /// A provisioning stage failed and prior stages were undone.
    #[error(
        "provisioning VM '{vm_id}' failed at stage {stage} ({}): {source}",
        rollback_label(.rolled_back)
    )]
    Provision {
        /// VM being provisioned.
        vm_id: String,
        /// Stage that failed.
        stage: ProvisionStage,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
        /// Whether every rollback step succeeded.
        rolled_back: bool,
    },

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {}", format_after(.after))]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The bound that elapsed.
        after: Duration,
    },

    /// The operation was cancelled by agent shutdown.
    #[error("{0} cancelled")]
    Cancelled(String),

    /// Hypervisor driver failure.
    #[error("driver {operation} failed: {message}")]
    Driver {
        /// Driver operation.
        operation: String,
        /// Failure detail.
        message: String,
    },

    /// Object store failure.
    #[error("object store: {0}")]
    ObjectStore(String),

    /// Remote script execution failure.
    #[error("remote exec: {0}")]
    Remote(String),

    /// Machine identifier generation failure.
    #[error("machine id: {0}")]
    MachineId(String),

    /// Filesystem operation failure.
    #[error("storage {operation} failed: {message}")]
    Storage {
        /// Operation being performed.
        operation: String,
        /// Failure detail.
        message: String,
    },

    /// Heartbeat delivery failure.
    #[error("heartbeat: {0}")]
    Heartbeat(String),

    /// Configuration error.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn rollback_label(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        "rolled back"
    } else {
        "rollback incomplete"
    }
}

fn format_after(after: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*after)
}

impl Error {
    /// Create a driver error.
    pub fn driver(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// The failing stage, for provisioning errors.
    pub fn stage(&self) -> Option<ProvisionStage> {
        match self {
            Self::Provision { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
