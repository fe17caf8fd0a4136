//! Custom error types for the application.
//!
//! This module defines the primary error type, `BeamlineError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from I/O and configuration issues to hardware-specific problems.
//!
//! ## Error Hierarchy
//!
//! `BeamlineError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such
//!   as values that parse correctly but are logically invalid. These are
//!   caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error`, covering all file I/O issues
//!   such as disk scans and summary files.
//! - **`Device`**: A general category for errors originating from hardware
//!   collaborators, anything from a failed motion to an invalid mode request.
//! - **`NotMounted` / `MountFailed` / `MissingResults`**: Fatal-to-run
//!   automation failures. These halt the running sequence and surface as an
//!   `error` state transition on the owning engine.
//! - **`NotImplemented`**: A distinct programming error raised when an engine
//!   is started without a body. This is signalled at call time rather than
//!   being masked as a hardware fault.
//!
//! By using `#[from]`, `BeamlineError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the
//! application with the `?` operator. Engine bodies and the CLI use
//! `anyhow::Result` and attach context as they go; `BeamlineError` carries the
//! structured cases that callers match on.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BeamlineError>;

#[derive(Error, Debug)]
pub enum BeamlineError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Detector failed to start")]
    DetectorStart,

    #[error("Sample {0} is not mounted")]
    NotMounted(String),

    #[error("Mounting failed for port {0}")]
    MountFailed(String),

    #[error("No acquisition results available for sample {0}")]
    MissingResults(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Engine '{0}' has no body: run() not implemented")]
    NotImplemented(String),
}
