//! Error types.
//!
//! [`ControllerError`] is returned to remote callers of the controller services.
//! [`RegistrationError`] drives the retry decisions of the registration loop.

use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessId;

/// Errors surfaced to the callers of the process controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("testsuite `{testsuite}' exe `{exe}' start failed: {cause}")]
    ProcessStartFailure {
        testsuite: String,
        exe: String,
        cause: String,
    },

    #[error("timed out after {}ms waiting for the process", timeout.as_millis())]
    ProcessTimeout { timeout: Duration },

    #[error("process failed:\n{output}")]
    ProcessFailed { output: String },

    #[error("invalid process handle {0}")]
    InvalidHandle(ProcessId),
}

impl From<ControllerError> for capnp::Error {
    fn from(err: ControllerError) -> Self {
        capnp::Error::failed(err.to_string())
    }
}

/// Errors raised while registering with the process controller registry.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The registry could not be reached; always retried.
    #[error("registry unreachable: {0}")]
    Connectivity(String),

    /// The registry answered with an error; never retried.
    #[error("registry error: {0}")]
    Application(capnp::Error),
}

impl RegistrationError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RegistrationError::Connectivity(_))
    }
}

impl From<capnp::Error> for RegistrationError {
    fn from(err: capnp::Error) -> Self {
        match err.kind {
            capnp::ErrorKind::Disconnected | capnp::ErrorKind::Overloaded => {
                RegistrationError::Connectivity(err.to_string())
            }
            _ => RegistrationError::Application(err),
        }
    }
}

impl From<std::io::Error> for RegistrationError {
    fn from(err: std::io::Error) -> Self {
        RegistrationError::Connectivity(err.to_string())
    }
}
