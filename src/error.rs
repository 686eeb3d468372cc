use thiserror::Error;

use crate::config::ConfigError;
use crate::types::LensFacing;

/// Failures reported by the AVFoundation backend.
///
/// The controller folds these into [`Error::DeviceAccess`] or
/// [`Error::ConfigurationFailure`] depending on where they happened.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlatformError {
    #[error("{0}")]
    Message(String),
    /// An Objective-C exception, captured as its description so the error
    /// can cross threads.
    #[cfg(target_os = "macos")]
    #[error("Objective-C exception: {0}")]
    ObjCException(String),
}

/// Top-level crate error.
///
/// Device and session failures end up here; the controller logs them, moves
/// the session to a terminal state and keeps the latest for
/// [`last_error`](crate::DeviceSessionController::last_error). Per-frame
/// failures never reach this type: the dispatcher handles
/// [`ProcessingError`](crate::ProcessingError) and
/// [`ConversionError`](crate::ConversionError) by dropping that frame's
/// processed output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("camera permission not granted")]
    PermissionDenied,
    #[error("no {0} camera found")]
    NoMatchingDevice(LensFacing),
    #[error("device access failed: {0}")]
    DeviceAccess(String),
    #[error("capture configuration failed: {0}")]
    ConfigurationFailure(String),
    #[error("camera disconnected")]
    DeviceDisconnected,
    #[error("camera device error {0}")]
    Device(i32),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn thread {name:?}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap a backend error as a device access failure.
    pub(crate) fn device_access(e: impl core::fmt::Display) -> Self {
        Error::DeviceAccess(e.to_string())
    }

    pub(crate) fn configuration(e: impl core::fmt::Display) -> Self {
        Error::ConfigurationFailure(e.to_string())
    }
}
