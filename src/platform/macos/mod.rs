use crate::error::PlatformError;

pub mod device;
pub mod ext;
pub mod frame;
pub mod session;

pub use device::{MacosCameraDevice, MacosCameraManager, MacosPreviewTarget};
pub use frame::MacosFrame;
pub use session::MacosCaptureSession;

/// Catch Objective-C exceptions and convert them to our error type.
fn catch_objc<R>(f: impl FnOnce() -> R + std::panic::UnwindSafe) -> Result<R, PlatformError> {
    objc2::exception::catch(f).map_err(|exception| {
        PlatformError::ObjCException(
            exception
                .map(|e| format!("{e:?}"))
                .unwrap_or_else(|| "unknown Objective-C exception".into()),
        )
    })
}
