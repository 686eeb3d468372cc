use serde::{Deserialize, Serialize};

use crate::types::Resolution;

/// Autofocus behaviour requested for the repeating capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutofocusMode {
    Off,
    Auto,
    /// Continuously refocus, tuned for smooth video rather than stills.
    #[default]
    ContinuousVideo,
    ContinuousPicture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoExposureMode {
    Off,
    #[default]
    On,
}

/// Parameters of the repeating request that keeps frames flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub resolution: Resolution,
    pub autofocus: AutofocusMode,
    pub auto_exposure: AutoExposureMode,
}

/// A configured capture session feeding the preview and the frame reader.
pub trait CaptureSession: Send + 'static {
    type Error: core::error::Error + Send + Sync + 'static;

    /// Start (or replace) the repeating request. Frames flow until
    /// [`stop_repeating`](Self::stop_repeating) or [`close`](Self::close).
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), Self::Error>;

    fn stop_repeating(&mut self) -> Result<(), Self::Error>;

    fn close(self) -> Result<(), Self::Error>;
}
