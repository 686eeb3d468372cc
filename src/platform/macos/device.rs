use std::ptr::NonNull;

use block2::RcBlock;
use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2_av_foundation::{
    AVAuthorizationStatus, AVCaptureDevice, AVCaptureDeviceInput, AVCaptureDevicePosition,
    AVCaptureDeviceWasDisconnectedNotification, AVCaptureSession, AVMediaType, AVMediaTypeVideo,
};
use objc2_core_media::CMVideoFormatDescriptionGetDimensions;
use objc2_foundation::{NSNotification, NSNotificationCenter, NSObjectProtocol};
use tracing::debug;

use crate::device::{CameraDevice, CameraManager, DeviceEvents, PreviewTarget};
use crate::error::PlatformError;
use crate::platform::macos::frame::{MacosFrame, is_biplanar_420};
use crate::platform::macos::session::MacosCaptureSession;
use crate::reader::FrameProducer;
use crate::types::{LensFacing, PixelFormat, Resolution};

pub(crate) type ObserverToken = Retained<ProtocolObject<dyn NSObjectProtocol>>;

fn video_media_type() -> Result<&'static AVMediaType, PlatformError> {
    unsafe { AVMediaTypeVideo }
        .ok_or_else(|| PlatformError::Message("AVMediaTypeVideo not available".into()))
}

/// macOS camera manager using AVFoundation.
#[derive(Default)]
pub struct MacosCameraManager;

impl MacosCameraManager {
    fn devices(&self) -> Result<Vec<Retained<AVCaptureDevice>>, PlatformError> {
        let media_type = video_media_type()?;
        #[allow(deprecated)]
        let devices = unsafe { AVCaptureDevice::devicesWithMediaType(media_type) };
        Ok(devices.iter().collect())
    }

    fn device(&self, id: &str) -> Result<Retained<AVCaptureDevice>, PlatformError> {
        self.devices()?
            .into_iter()
            .find(|d| unsafe { d.uniqueID() }.to_string() == id)
            .ok_or_else(|| PlatformError::Message(format!("no camera with id {id}")))
    }
}

impl CameraManager for MacosCameraManager {
    type Device = MacosCameraDevice;
    type Error = PlatformError;

    fn device_ids(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self
            .devices()?
            .iter()
            .map(|d| unsafe { d.uniqueID() }.to_string())
            .collect())
    }

    fn lens_facing(&self, id: &str) -> Result<LensFacing, Self::Error> {
        let device = self.device(id)?;
        Ok(match unsafe { device.position() } {
            AVCaptureDevicePosition::Back => LensFacing::Back,
            AVCaptureDevicePosition::Front => LensFacing::Front,
            _ => LensFacing::External,
        })
    }

    fn output_sizes(&self, id: &str, format: PixelFormat) -> Result<Vec<Resolution>, Self::Error> {
        if format != PixelFormat::Yuv420 {
            return Err(PlatformError::Message(format!("{format:?} capture not supported")));
        }
        let device = self.device(id)?;
        let mut sizes = Vec::new();
        for f in unsafe { device.formats() }.iter() {
            let desc = unsafe { f.formatDescription() };
            if !is_biplanar_420(unsafe { desc.media_sub_type() }) {
                continue;
            }
            let dims = unsafe { CMVideoFormatDescriptionGetDimensions(&desc) };
            let size = Resolution::new(dims.width as u32, dims.height as u32);
            if !sizes.contains(&size) {
                sizes.push(size);
            }
        }
        Ok(sizes)
    }

    fn camera_permission_granted(&self) -> bool {
        let Ok(media_type) = video_media_type() else {
            return false;
        };
        let status = unsafe { AVCaptureDevice::authorizationStatusForMediaType(media_type) };
        status == AVAuthorizationStatus::Authorized
    }

    fn open_device(
        &mut self,
        id: &str,
        events: DeviceEvents<MacosCameraDevice>,
    ) -> Result<(), Self::Error> {
        let device = self.device(id)?;
        let input = unsafe { AVCaptureDeviceInput::deviceInputWithDevice_error(&device) }
            .map_err(|e| PlatformError::Message(e.to_string()))?;
        let disconnect_observer = observe_disconnect(&device, events.clone());
        events.opened(MacosCameraDevice::new(device, input, disconnect_observer));
        Ok(())
    }
}

fn observe_disconnect(
    device: &AVCaptureDevice,
    events: DeviceEvents<MacosCameraDevice>,
) -> ObserverToken {
    let block = RcBlock::new(move |_: NonNull<NSNotification>| events.disconnected());
    let center = NSNotificationCenter::defaultCenter();
    let object: &AnyObject = device.as_ref();
    unsafe {
        center.addObserverForName_object_queue_usingBlock(
            Some(AVCaptureDeviceWasDisconnectedNotification),
            Some(object),
            None,
            &block,
        )
    }
}

pub(crate) fn remove_observer(token: &ObserverToken) {
    let center = NSNotificationCenter::defaultCenter();
    let object: &AnyObject = token.as_ref();
    unsafe { center.removeObserver(object) };
}

/// The preview surface for a macOS session.
///
/// AVFoundation previews attach to the session itself (for example through
/// an `AVCaptureVideoPreviewLayer`), so the target receives the session once
/// it is built.
#[derive(Default)]
pub struct MacosPreviewTarget {
    size: Option<Resolution>,
    attach: Option<Box<dyn FnMut(&AVCaptureSession, Resolution) + Send>>,
}

impl MacosPreviewTarget {
    pub fn new(attach: impl FnMut(&AVCaptureSession, Resolution) + Send + 'static) -> Self {
        MacosPreviewTarget {
            size: None,
            attach: Some(Box::new(attach)),
        }
    }

    pub fn buffer_size(&self) -> Option<Resolution> {
        self.size
    }

    pub(crate) fn attach(&mut self, session: &AVCaptureSession) {
        if let (Some(attach), Some(size)) = (self.attach.as_mut(), self.size) {
            attach(session, size);
        }
    }
}

impl PreviewTarget for MacosPreviewTarget {
    fn set_default_buffer_size(&mut self, resolution: Resolution) {
        self.size = Some(resolution);
    }
}

/// An opened `AVCaptureDevice` and its input.
pub struct MacosCameraDevice {
    pub(crate) device: Retained<AVCaptureDevice>,
    input: Retained<AVCaptureDeviceInput>,
    id: String,
    disconnect_observer: Option<ObserverToken>,
}

// SAFETY: AVCaptureDevice and AVCaptureDeviceInput may be used from any
// thread; configuration changes are serialised by the device's configuration
// lock, and the controller only touches a device from its control thread.
unsafe impl Send for MacosCameraDevice {}

impl MacosCameraDevice {
    fn new(
        device: Retained<AVCaptureDevice>,
        input: Retained<AVCaptureDeviceInput>,
        disconnect_observer: ObserverToken,
    ) -> Self {
        let id = unsafe { device.uniqueID() }.to_string();
        MacosCameraDevice {
            device,
            input,
            id,
            disconnect_observer: Some(disconnect_observer),
        }
    }

    /// Access the underlying `AVCaptureDevice`.
    pub fn av_device(&self) -> &AVCaptureDevice {
        &self.device
    }
}

impl CameraDevice for MacosCameraDevice {
    type Session = MacosCaptureSession;
    type Frame = MacosFrame;
    type Preview = MacosPreviewTarget;
    type Error = PlatformError;

    fn id(&self) -> &str {
        &self.id
    }

    fn create_capture_session(
        &mut self,
        preview: &mut MacosPreviewTarget,
        output: FrameProducer<MacosFrame>,
        events: DeviceEvents<Self>,
    ) -> Result<(), Self::Error> {
        let session = MacosCaptureSession::new(&self.device, &self.input, output, events.clone())?;
        preview.attach(session.av_session());
        events.session_configured(session);
        Ok(())
    }

    fn close(mut self) -> Result<(), Self::Error> {
        if let Some(token) = self.disconnect_observer.take() {
            remove_observer(&token);
        }
        debug!(camera = %self.id, "camera device closed");
        Ok(())
    }
}

impl Drop for MacosCameraDevice {
    fn drop(&mut self) {
        if let Some(token) = self.disconnect_observer.take() {
            remove_observer(&token);
        }
    }
}
