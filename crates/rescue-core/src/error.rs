//! Top-level error taxonomy and stage outcomes.
//!
//! Component errors (`TransportError`, `ToolError`, `BundleError`, ...) are
//! converted into a [`RecoveryError`] at the stage boundary; only fatal
//! errors abort a run.

use thiserror::Error;

use crate::bundle::BundleError;
use crate::state::FlashError;
use crate::tools::ToolError;
use crate::transport::TransportError;

/// How a failure affects the operation that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged, the operation continues.
    Advisory,
    /// The operation stops.
    Fatal,
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Could not open a USB session: {0}")]
    SessionOpenFailed(String),

    #[error("Transfer failed: {message}")]
    TransferFailed { timed_out: bool, message: String },

    #[error("Firmware archive is invalid: {0}")]
    ValidationFailed(String),

    #[error("Component {component} not found in firmware")]
    ComponentMissing { component: String, required: bool },

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("External tool failed: {0}")]
    ExternalToolFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Another recovery operation is already running")]
    Busy,
}

impl RecoveryError {
    pub fn severity(&self) -> Severity {
        match self {
            RecoveryError::ComponentMissing { required: false, .. }
            | RecoveryError::SigningUnavailable(_) => Severity::Advisory,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl From<TransportError> for RecoveryError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoDeviceFound => RecoveryError::DeviceNotFound(e.to_string()),
            TransportError::OpenFailed(_)
            | TransportError::DeviceBusy { .. }
            | TransportError::EnumerationFailed(_) => {
                RecoveryError::SessionOpenFailed(e.to_string())
            }
            TransportError::TransferTimeout { .. } => RecoveryError::TransferFailed {
                timed_out: true,
                message: e.to_string(),
            },
            other => RecoveryError::TransferFailed {
                timed_out: false,
                message: other.to_string(),
            },
        }
    }
}

impl From<ToolError> for RecoveryError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Cancelled { .. } => RecoveryError::Cancelled,
            other => RecoveryError::ExternalToolFailed(other.to_string()),
        }
    }
}

impl From<BundleError> for RecoveryError {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::MissingComponent { component, required } => {
                RecoveryError::ComponentMissing {
                    component: component.to_string(),
                    required,
                }
            }
            other => RecoveryError::ValidationFailed(other.to_string()),
        }
    }
}

impl From<FlashError> for RecoveryError {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Cancelled => RecoveryError::Cancelled,
            FlashError::DeviceNotInRecovery { .. } => RecoveryError::DeviceNotFound(e.to_string()),
            other => RecoveryError::ExternalToolFailed(other.to_string()),
        }
    }
}

/// Result of one orchestrator stage.
#[derive(Debug)]
pub enum StageOutcome {
    Success,
    /// Something was skipped or degraded; the run continues.
    AdvisorySkip(String),
    /// The run stops at this stage.
    Fatal(RecoveryError),
}

impl StageOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageOutcome::Fatal(_))
    }
}

impl From<Result<(), RecoveryError>> for StageOutcome {
    fn from(result: Result<(), RecoveryError>) -> Self {
        match result {
            Ok(()) => StageOutcome::Success,
            Err(e) if e.is_fatal() => StageOutcome::Fatal(e),
            Err(e) => StageOutcome::AdvisorySkip(e.to_string()),
        }
    }
}
