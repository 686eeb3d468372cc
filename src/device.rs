//! Backend traits for camera discovery, device access and event delivery.
//!
//! Devices and sessions come up asynchronously: a backend acknowledges a
//! request by returning `Ok(())` and later reports the outcome through the
//! [`DeviceEvents`] sink it was handed. Every event is stamped with the open
//! attempt it belongs to, so late events from a superseded attempt can be
//! recognised and their resources released.

use crossbeam_channel::Sender;
use tracing::{trace, warn};

use crate::capture::CaptureSession;
use crate::frame::Frame;
use crate::reader::FrameProducer;
use crate::types::{LensFacing, PixelFormat, Resolution};

/// Discover cameras and open them.
pub trait CameraManager: Send + 'static {
    type Device: CameraDevice;
    type Error: core::error::Error + Send + Sync + 'static;

    fn device_ids(&self) -> Result<Vec<String>, Self::Error>;
    fn lens_facing(&self, id: &str) -> Result<LensFacing, Self::Error>;

    /// Sizes the device can stream in `format`, in the backend's preferred
    /// order.
    fn output_sizes(&self, id: &str, format: PixelFormat) -> Result<Vec<Resolution>, Self::Error>;

    fn camera_permission_granted(&self) -> bool;

    /// Request the device. The outcome arrives as
    /// [`DeviceEvent::Opened`], [`DeviceEvent::Disconnected`] or
    /// [`DeviceEvent::Error`].
    fn open_device(
        &mut self,
        id: &str,
        events: DeviceEvents<Self::Device>,
    ) -> Result<(), Self::Error>;
}

/// An opened camera.
pub trait CameraDevice: Sized + Send + 'static {
    type Session: CaptureSession;
    type Frame: Frame + Send + 'static;
    type Preview: PreviewTarget;
    type Error: core::error::Error + Send + Sync + 'static;

    fn id(&self) -> &str;

    /// Build one session targeting both `preview` and `output`. The outcome
    /// arrives as [`DeviceEvent::SessionConfigured`] or
    /// [`DeviceEvent::SessionConfigureFailed`].
    fn create_capture_session(
        &mut self,
        preview: &mut Self::Preview,
        output: FrameProducer<Self::Frame>,
        events: DeviceEvents<Self>,
    ) -> Result<(), Self::Error>;

    fn close(self) -> Result<(), Self::Error>;
}

/// The on-screen surface frames are mirrored to.
pub trait PreviewTarget: Send + 'static {
    fn set_default_buffer_size(&mut self, resolution: Resolution);
}

/// Something a backend reports about a device or its session.
pub enum DeviceEvent<D: CameraDevice> {
    Opened(D),
    Disconnected,
    /// Backend-specific error code.
    Error(i32),
    SessionConfigured(D::Session),
    SessionConfigureFailed(String),
}

impl<D: CameraDevice> DeviceEvent<D> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Opened(_) => "opened",
            Self::Disconnected => "disconnected",
            Self::Error(_) => "error",
            Self::SessionConfigured(_) => "session configured",
            Self::SessionConfigureFailed(_) => "session configure failed",
        }
    }

    /// Drop the event, closing any device or session it carries.
    pub fn discard(self) {
        let result = match self {
            Self::Opened(device) => device.close().map_err(|e| e.to_string()),
            Self::SessionConfigured(session) => session.close().map_err(|e| e.to_string()),
            _ => Ok(()),
        };
        if let Err(error) = result {
            warn!(%error, "failed to release resources of a discarded event");
        }
    }
}

impl<D: CameraDevice> core::fmt::Debug for DeviceEvent<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Opened(device) => f.debug_tuple("Opened").field(&device.id()).finish(),
            Self::Error(code) => f.debug_tuple("Error").field(code).finish(),
            Self::SessionConfigureFailed(reason) => {
                f.debug_tuple("SessionConfigureFailed").field(reason).finish()
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// A [`DeviceEvent`] tagged with the open attempt it belongs to.
#[derive(Debug)]
pub struct StampedEvent<D: CameraDevice> {
    pub attempt: u64,
    pub event: DeviceEvent<D>,
}

/// Sink backends use to report device and session events.
///
/// Cheap to clone and callable from any thread. Once the receiving side is
/// gone, events are discarded and any resources they carry are closed.
pub struct DeviceEvents<D: CameraDevice> {
    attempt: u64,
    sink: Sender<StampedEvent<D>>,
}

impl<D: CameraDevice> Clone for DeviceEvents<D> {
    fn clone(&self) -> Self {
        DeviceEvents {
            attempt: self.attempt,
            sink: self.sink.clone(),
        }
    }
}

impl<D: CameraDevice> DeviceEvents<D> {
    pub fn new(attempt: u64, sink: Sender<StampedEvent<D>>) -> Self {
        DeviceEvents { attempt, sink }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn opened(&self, device: D) {
        self.send(DeviceEvent::Opened(device));
    }

    pub fn disconnected(&self) {
        self.send(DeviceEvent::Disconnected);
    }

    pub fn error(&self, code: i32) {
        self.send(DeviceEvent::Error(code));
    }

    pub fn session_configured(&self, session: D::Session) {
        self.send(DeviceEvent::SessionConfigured(session));
    }

    pub fn session_configure_failed(&self, reason: impl Into<String>) {
        self.send(DeviceEvent::SessionConfigureFailed(reason.into()));
    }

    fn send(&self, event: DeviceEvent<D>) {
        let stamped = StampedEvent {
            attempt: self.attempt,
            event,
        };
        if let Err(returned) = self.sink.send(stamped) {
            let event = returned.into_inner().event;
            trace!(kind = event.kind(), "no controller listening; discarding event");
            event.discard();
        }
    }
}
