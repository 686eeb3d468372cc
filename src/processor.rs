use thiserror::Error;

use crate::types::Resolution;

/// Why the external routine produced no result for a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcessingError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("processor returned no output")]
    NoOutput,
    #[error("native processor failed with status {0}")]
    NativeStatus(i32),
    #[error("processor panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

/// The synchronous image-processing capability frames are forwarded to.
///
/// Input is an NV21 buffer (`resolution.pixel_count() * 3 / 2` bytes). The
/// processor is called from the acquisition worker, one frame at a time.
pub trait FrameProcessor: Send + Sync {
    fn process_frame(&self, nv21: &[u8], resolution: Resolution)
    -> Result<Vec<u8>, ProcessingError>;
}

impl<F> FrameProcessor for F
where
    F: Fn(&[u8], Resolution) -> Result<Vec<u8>, ProcessingError> + Send + Sync,
{
    fn process_frame(
        &self,
        nv21: &[u8],
        resolution: Resolution,
    ) -> Result<Vec<u8>, ProcessingError> {
        self(nv21, resolution)
    }
}

/// A processor that never produces output.
///
/// Useful when only preview and latency reporting are wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessor;

impl FrameProcessor for NoopProcessor {
    fn process_frame(&self, _: &[u8], _: Resolution) -> Result<Vec<u8>, ProcessingError> {
        Err(ProcessingError::NoOutput)
    }
}
