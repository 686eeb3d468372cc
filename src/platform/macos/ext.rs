use objc2_av_foundation::{AVCaptureDevice, AVCaptureExposureMode, AVCaptureFocusMode};
use tracing::debug;

use crate::capture::{AutoExposureMode, AutofocusMode, CaptureRequest};
use crate::error::PlatformError;
use crate::platform::macos::catch_objc;

/// RAII guard for `AVCaptureDevice` configuration lock.
pub struct ConfigLockGuard<'a> {
    device: &'a AVCaptureDevice,
}

impl<'a> ConfigLockGuard<'a> {
    pub fn device(&self) -> &AVCaptureDevice {
        self.device
    }
}

impl<'a> Drop for ConfigLockGuard<'a> {
    fn drop(&mut self) {
        unsafe { self.device.unlockForConfiguration() };
    }
}

pub fn lock_for_configuration(device: &AVCaptureDevice) -> Result<ConfigLockGuard<'_>, PlatformError> {
    unsafe { device.lockForConfiguration() }
        .map_err(|e| PlatformError::Message(e.to_string()))?;
    Ok(ConfigLockGuard { device })
}

pub(crate) fn focus_mode(mode: AutofocusMode) -> AVCaptureFocusMode {
    match mode {
        AutofocusMode::Off => AVCaptureFocusMode::Locked,
        AutofocusMode::Auto => AVCaptureFocusMode::AutoFocus,
        AutofocusMode::ContinuousVideo | AutofocusMode::ContinuousPicture => {
            AVCaptureFocusMode::ContinuousAutoFocus
        }
    }
}

pub(crate) fn exposure_mode(mode: AutoExposureMode) -> AVCaptureExposureMode {
    match mode {
        AutoExposureMode::Off => AVCaptureExposureMode::Locked,
        AutoExposureMode::On => AVCaptureExposureMode::ContinuousAutoExposure,
    }
}

/// Apply the request's focus and exposure modes.
///
/// The caller must hold the device's configuration lock. Modes the device
/// does not support are left as they are; many built-in webcams have fixed
/// focus.
pub(crate) fn apply_capture_modes(
    device: &AVCaptureDevice,
    request: &CaptureRequest,
) -> Result<(), PlatformError> {
    let focus = focus_mode(request.autofocus);
    let exposure = exposure_mode(request.auto_exposure);
    let focus_supported = unsafe { device.isFocusModeSupported(focus) };
    let exposure_supported = unsafe { device.isExposureModeSupported(exposure) };

    catch_objc(std::panic::AssertUnwindSafe(|| unsafe {
        if focus_supported {
            device.setFocusMode(focus);
        }
        if exposure_supported {
            device.setExposureMode(exposure);
        }
    }))?;

    if !focus_supported {
        debug!(mode = ?request.autofocus, "focus mode not supported by device");
    }
    if !exposure_supported {
        debug!(mode = ?request.auto_exposure, "exposure mode not supported by device");
    }
    Ok(())
}
