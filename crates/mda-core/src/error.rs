//! Error types for acquisition sequencing.
//!
//! `MdaError` is the single error type surfaced by the engine. Variants fall
//! into a handful of categories that determine how a caller should react:
//!
//! - **Configuration**: the settings snapshot is invalid. Raised while the
//!   event pipeline is being built, before any hardware is touched.
//! - **Preflight**: the save destination or free disk space does not allow
//!   the run to start.
//! - **Hardware**: a device call failed while dispatching an event. The run is
//!   aborted without retry, already captured images are kept and the
//!   `Ended` document still fires.
//! - **State**: the engine was asked to do something its current state does
//!   not allow (e.g. start while already running).
//! - **Internal**: queue, storage and arithmetic failures.
//!
//! Device drivers report through `anyhow::Result`; the engine converts those
//! into [`MdaError::Hardware`] tagged with the operation that failed.

use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Coarse classification of a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be brought up.
    Initialization,
    /// Device rejected its configuration.
    Configuration,
    /// Link to the device failed.
    Communication,
    /// Device reported a hardware fault.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Argument out of the device's range.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured failure raised by a device driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that raised the error (e.g. `"mock_stage"`).
    pub driver_type: String,
    /// Failure classification.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error from any string-like parts.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Category an [`MdaError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid settings, detected before hardware is touched.
    Configuration,
    /// Destination or disk-space checks blocked the start.
    Preflight,
    /// A device call failed during dispatch.
    Hardware,
    /// Operation not allowed in the current engine state.
    State,
    /// Queue, storage or arithmetic failure.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Preflight => "preflight",
            ErrorCategory::Hardware => "hardware",
            ErrorCategory::State => "state",
            ErrorCategory::Internal => "internal",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the engine error type.
pub type MdaResult<T> = std::result::Result<T, MdaError>;

/// Primary error type for acquisition sequencing.
#[derive(Error, Debug)]
pub enum MdaError {
    /// Layered engine configuration could not be extracted.
    ///
    /// Wraps the figment error produced while merging defaults, the TOML file
    /// and `MDA_` environment variables.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A sequence settings file is not valid TOML or has the wrong shape.
    #[error("Settings parse error: {0}")]
    SettingsParse(#[from] toml::de::Error),

    /// Settings parse but are semantically invalid.
    ///
    /// **Recovery Strategy**: fix the settings and start again. No hardware
    /// has been touched when this is returned.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A bounded Z range was given a zero step.
    ///
    /// The stack would never reach its stop value, so the run is refused.
    #[error("Slice step must be non-zero for a bounded Z range")]
    ZeroSliceStep,

    /// A named surface is missing from the settings or cannot be fitted.
    #[error("Surface '{name}' is unusable: {reason}")]
    InvalidSurface {
        /// Surface name as referenced by the settings.
        name: String,
        /// Why it could not be used.
        reason: String,
    },

    /// The focus device reported neither a positive nor a negative direction.
    ///
    /// Surface-relative stacks cannot tell "above" from "below" without it.
    #[error(
        "Focus device '{device}' reported direction {raw}; expected a positive or negative value"
    )]
    FocusDirectionUndefined {
        /// Focus drive name.
        device: String,
        /// Raw value returned by the device.
        raw: i32,
    },

    /// The save root cannot be created or written to.
    #[error("Save location '{}' is not writable: {reason}", path.display())]
    DestinationNotWritable {
        /// Directory that was probed.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Not enough free space for the estimated image volume.
    ///
    /// `required_bytes` already includes the safety factor from the engine
    /// configuration.
    #[error(
        "Insufficient disk space: {required_bytes} bytes required, {available_bytes} bytes available"
    )]
    InsufficientDiskSpace {
        /// Bytes needed including the safety factor.
        required_bytes: u64,
        /// Bytes free on the destination volume.
        available_bytes: u64,
    },

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device call failed while an event was being dispatched.
    #[error("Hardware error during {operation}: {message}")]
    Hardware {
        /// Operation being performed (e.g. `"move focus"`).
        operation: String,
        /// Message of the underlying failure chain.
        message: String,
    },

    /// Structured driver error surfaced directly.
    #[error("{0}")]
    Driver(DriverError),

    /// A run was requested while another one is active.
    #[error("Acquisition already running (state: {0})")]
    AlreadyRunning(String),

    /// Pause, resume or stop was requested in a state that does not allow it.
    #[error("Cannot {operation} while the engine is {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Engine state at the time.
        state: String,
    },

    /// The image sink went away before the producer finished.
    #[error("Image queue closed before the acquisition finished")]
    QueueClosed,

    /// Datastore rejected an image or could not be frozen.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Calculating a size overflowed.
    #[error("Size overflow while computing {context}")]
    SizeOverflow {
        /// What was being computed.
        context: &'static str,
    },
}

impl From<figment::Error> for MdaError {
    fn from(err: figment::Error) -> Self {
        MdaError::Config(Box::new(err))
    }
}

impl MdaError {
    /// Wrap a driver failure raised while performing `operation`.
    pub fn hardware(operation: impl Into<String>, err: &anyhow::Error) -> Self {
        if let Some(driver) = err.downcast_ref::<DriverError>() {
            return MdaError::Hardware {
                operation: operation.into(),
                message: driver.to_string(),
            };
        }
        MdaError::Hardware {
            operation: operation.into(),
            message: format!("{:#}", err),
        }
    }

    /// Category used by callers to decide how to react.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            MdaError::Config(_)
            | MdaError::SettingsParse(_)
            | MdaError::Configuration(_)
            | MdaError::ZeroSliceStep
            | MdaError::InvalidSurface { .. }
            | MdaError::FocusDirectionUndefined { .. } => ErrorCategory::Configuration,
            MdaError::DestinationNotWritable { .. } | MdaError::InsufficientDiskSpace { .. } => {
                ErrorCategory::Preflight
            }
            MdaError::Hardware { .. } | MdaError::Driver(_) => ErrorCategory::Hardware,
            MdaError::AlreadyRunning(_) | MdaError::InvalidState { .. } => ErrorCategory::State,
            MdaError::Io(_)
            | MdaError::QueueClosed
            | MdaError::Storage(_)
            | MdaError::SizeOverflow { .. } => ErrorCategory::Internal,
        }
    }
}
