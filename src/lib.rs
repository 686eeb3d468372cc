pub mod acquisition;
pub mod capture;
pub mod config;
pub mod convert;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod platform;
pub mod processor;
pub mod reader;
pub mod session;
pub mod types;

// Re-exports
pub use capture::*;
pub use config::{CaptureConfig, ConfigError};
pub use convert::{ConversionError, frame_to_nv21, nv21_len, yuv420_to_nv21};
pub use device::*;
pub use dispatch::{FrameCallback, ProcessingResult};
pub use error::*;
pub use frame::*;
pub use processor::{FrameProcessor, NoopProcessor, ProcessingError};
pub use session::{DeviceSessionController, SessionState};
pub use types::*;

use std::any::Any;
use std::thread::JoinHandle;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Spawn a named thread that logs through the caller's current subscriber.
pub(crate) fn spawn_named<T, F>(name: &str, f: F) -> Result<JoinHandle<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
        .map_err(|source| Error::Spawn {
            name: name.to_owned(),
            source,
        })
}
