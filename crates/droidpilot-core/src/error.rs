//! Crate-level error taxonomy.
//!
//! Every rejected operation surfaces as a [`DriverError`]. Lower layers keep
//! their own error enums ([`DeviceError`], [`ProxyError`]) which convert into
//! the matching `DriverError` variant with `?`.

use thiserror::Error;

use crate::bridge::DeviceError;
use crate::secondary::ProxyError;

/// Errors returned by session and command operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Invalid or missing capabilities. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The command is not available for this device (e.g. emulator-only
    /// commands on real hardware).
    #[error("{0}")]
    UnsupportedOperation(String),

    /// The requested web context could not be attached (yet).
    #[error("No such context found: {0}")]
    NoSuchContext(String),

    /// A device bridge call failed.
    #[error("Device communication failed: {0}")]
    DeviceCommunication(#[from] DeviceError),

    /// An operation addressed a session other than the one it is bound to.
    #[error("Session id '{actual}' does not match the active session '{expected}'")]
    SessionMismatch {
        /// The id of the bound session.
        expected: String,
        /// The id the caller supplied.
        actual: String,
    },

    /// No session with the given id exists.
    #[error("Session '{0}' does not exist or has already been deleted")]
    NoSuchSession(String),

    /// No element matched the locator, or an element id is unknown.
    #[error("No such element: {0}")]
    NoSuchElement(String),

    /// The locator strategy is not supported.
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// A command argument was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Forwarding to the secondary browser driver failed.
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

impl DriverError {
    /// The remote-protocol error string for this error.
    pub fn w3c_code(&self) -> &'static str {
        match self {
            DriverError::Configuration(_) => "session not created",
            DriverError::UnsupportedOperation(_) => "unsupported operation",
            DriverError::NoSuchContext(_) => "no such context",
            DriverError::DeviceCommunication(_) => "unknown error",
            DriverError::SessionMismatch { .. } | DriverError::NoSuchSession(_) => {
                "invalid session id"
            }
            DriverError::NoSuchElement(_) => "no such element",
            DriverError::InvalidSelector(_) => "invalid selector",
            DriverError::InvalidArgument(_) => "invalid argument",
            DriverError::Proxy(ProxyError::Remote { error, .. }) if error == "no such context" => {
                "no such context"
            }
            DriverError::Proxy(_) => "unknown error",
        }
    }

    /// True when a bounded context-switch retry should try again.
    pub fn is_no_such_context(&self) -> bool {
        matches!(self, DriverError::NoSuchContext(_))
    }
}
