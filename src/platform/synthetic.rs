//! A virtual camera backend.
//!
//! Generates YUV 4:2:0 frames on a background thread at a fixed interval.
//! The device list, permission state, chroma layout and a handful of
//! failures can be configured, and a [`SyntheticProbe`] observes what the
//! backend was asked to do and can inject disconnects and device errors into
//! a running session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, select};
use thiserror::Error;
use tracing::{debug, trace};

use crate::capture::{CaptureRequest, CaptureSession};
use crate::device::{CameraDevice, CameraManager, DeviceEvents, PreviewTarget};
use crate::frame::YuvFrame;
use crate::reader::{FrameProducer, SubmitError};
use crate::spawn_named;
use crate::types::{LensFacing, PixelFormat, Resolution};

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyntheticError {
    #[error("unknown camera {0:?}")]
    UnknownCamera(String),
    #[error("pixel format {0:?} not supported")]
    UnsupportedFormat(PixelFormat),
    #[error("camera open rejected")]
    OpenRejected,
    #[error("repeating request rejected")]
    RequestRejected,
    #[error("failed to start frame generator")]
    Generator,
}

/// One virtual camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticCamera {
    pub id: String,
    pub facing: LensFacing,
    pub sizes: Vec<Resolution>,
}

impl SyntheticCamera {
    pub fn new(id: impl Into<String>, facing: LensFacing, sizes: impl Into<Vec<Resolution>>) -> Self {
        SyntheticCamera {
            id: id.into(),
            facing,
            sizes: sizes.into(),
        }
    }
}

/// How generated frames lay out their chroma samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaLayout {
    /// Three tightly packed planes.
    #[default]
    Planar,
    /// One buffer of interleaved V/U pairs; every row of both buffers is
    /// padded by `row_padding` bytes.
    SemiPlanarVu { row_padding: usize },
}

#[derive(Debug, Clone, Default)]
struct Faults {
    reject_open: bool,
    open_error: Option<i32>,
    fail_session: bool,
    reject_repeating: bool,
    panic_on_session_close: bool,
}

#[derive(Debug, Clone)]
struct Settings {
    frame_interval: Duration,
    layout: ChromaLayout,
    faults: Faults,
}

#[derive(Default)]
struct ProbeState {
    teardown: Vec<&'static str>,
    last_request: Option<CaptureRequest>,
    events: Option<DeviceEvents<SyntheticDevice>>,
}

#[derive(Default)]
struct ProbeInner {
    open_attempts: AtomicU64,
    sessions: AtomicU64,
    frames: AtomicU64,
    rejected: AtomicU64,
    state: Mutex<ProbeState>,
}

/// Observer and fault injector shared with a [`SyntheticBackend`].
#[derive(Clone, Default)]
pub struct SyntheticProbe {
    inner: Arc<ProbeInner>,
}

impl SyntheticProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `open_device` calls.
    pub fn open_attempts(&self) -> u64 {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }

    /// Capture sessions that reached the configured state.
    pub fn sessions(&self) -> u64 {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    /// Frames accepted by a frame reader.
    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::SeqCst)
    }

    /// Frames refused because the consumer held every slot.
    pub fn rejected_frames(&self) -> u64 {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    /// Teardown calls in the order they happened.
    pub fn teardown_log(&self) -> Vec<&'static str> {
        self.lock().teardown.clone()
    }

    pub fn last_request(&self) -> Option<CaptureRequest> {
        self.lock().last_request
    }

    /// Report the most recently opened device as disconnected.
    pub fn disconnect(&self) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            events.disconnected();
        }
    }

    /// Report a device error on the most recently opened device.
    pub fn device_error(&self, code: i32) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            events.error(code);
        }
    }

    fn log_teardown(&self, step: &'static str) {
        self.lock().teardown.push(step);
    }
}

/// Records the buffer size the controller negotiated.
#[derive(Debug, Clone, Default)]
pub struct SyntheticPreview {
    size: Arc<Mutex<Option<Resolution>>>,
}

impl SyntheticPreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(&self) -> Option<Resolution> {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreviewTarget for SyntheticPreview {
    fn set_default_buffer_size(&mut self, resolution: Resolution) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = Some(resolution);
    }
}

/// A [`CameraManager`] over virtual cameras.
pub struct SyntheticBackend {
    cameras: Vec<SyntheticCamera>,
    permission_granted: bool,
    settings: Settings,
    probe: SyntheticProbe,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        SyntheticBackend {
            cameras: Vec::new(),
            permission_granted: true,
            settings: Settings {
                frame_interval: Duration::from_millis(33),
                layout: ChromaLayout::Planar,
                faults: Faults::default(),
            },
            probe: SyntheticProbe::default(),
        }
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A back and a front camera offering a few common sizes.
    pub fn with_default_cameras() -> Self {
        let sizes = [
            Resolution::new(1920, 1080),
            Resolution::new(1280, 720),
            Resolution::new(640, 480),
            Resolution::new(320, 240),
        ];
        Self::new()
            .camera(SyntheticCamera::new("0", LensFacing::Back, sizes))
            .camera(SyntheticCamera::new("1", LensFacing::Front, sizes))
    }

    pub fn camera(mut self, camera: SyntheticCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn permission_granted(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.settings.frame_interval = interval;
        self
    }

    pub fn chroma_layout(mut self, layout: ChromaLayout) -> Self {
        self.settings.layout = layout;
        self
    }

    /// Make `open_device` itself fail.
    pub fn reject_open(mut self) -> Self {
        self.settings.faults.reject_open = true;
        self
    }

    /// Report `code` through the device callbacks instead of opening.
    pub fn open_error(mut self, code: i32) -> Self {
        self.settings.faults.open_error = Some(code);
        self
    }

    /// Report session configuration as failed.
    pub fn fail_session_configuration(mut self) -> Self {
        self.settings.faults.fail_session = true;
        self
    }

    pub fn reject_repeating_request(mut self) -> Self {
        self.settings.faults.reject_repeating = true;
        self
    }

    pub fn panic_on_session_close(mut self) -> Self {
        self.settings.faults.panic_on_session_close = true;
        self
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    fn find(&self, id: &str) -> Result<&SyntheticCamera, SyntheticError> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| SyntheticError::UnknownCamera(id.to_owned()))
    }
}

impl CameraManager for SyntheticBackend {
    type Device = SyntheticDevice;
    type Error = SyntheticError;

    fn device_ids(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.cameras.iter().map(|c| c.id.clone()).collect())
    }

    fn lens_facing(&self, id: &str) -> Result<LensFacing, Self::Error> {
        self.find(id).map(|c| c.facing)
    }

    fn output_sizes(&self, id: &str, format: PixelFormat) -> Result<Vec<Resolution>, Self::Error> {
        if format != PixelFormat::Yuv420 {
            return Err(SyntheticError::UnsupportedFormat(format));
        }
        self.find(id).map(|c| c.sizes.clone())
    }

    fn camera_permission_granted(&self) -> bool {
        self.permission_granted
    }

    fn open_device(
        &mut self,
        id: &str,
        events: DeviceEvents<SyntheticDevice>,
    ) -> Result<(), Self::Error> {
        self.probe.inner.open_attempts.fetch_add(1, Ordering::SeqCst);
        let camera = self.find(id)?;
        if self.settings.faults.reject_open {
            return Err(SyntheticError::OpenRejected);
        }

        self.probe.lock().events = Some(events.clone());
        if let Some(code) = self.settings.faults.open_error {
            events.error(code);
            return Ok(());
        }
        debug!(camera = %camera.id, "synthetic camera opened");
        events.opened(SyntheticDevice {
            id: camera.id.clone(),
            settings: self.settings.clone(),
            probe: self.probe.clone(),
        });
        Ok(())
    }
}

pub struct SyntheticDevice {
    id: String,
    settings: Settings,
    probe: SyntheticProbe,
}

impl CameraDevice for SyntheticDevice {
    type Session = SyntheticSession;
    type Frame = YuvFrame;
    type Preview = SyntheticPreview;
    type Error = SyntheticError;

    fn id(&self) -> &str {
        &self.id
    }

    fn create_capture_session(
        &mut self,
        _preview: &mut SyntheticPreview,
        output: FrameProducer<YuvFrame>,
        events: DeviceEvents<Self>,
    ) -> Result<(), Self::Error> {
        if self.settings.faults.fail_session {
            events.session_configure_failed("synthetic session rejected its outputs");
            return Ok(());
        }
        self.probe.inner.sessions.fetch_add(1, Ordering::SeqCst);
        events.session_configured(SyntheticSession {
            output,
            settings: self.settings.clone(),
            probe: self.probe.clone(),
            generator: None,
        });
        Ok(())
    }

    fn close(self) -> Result<(), Self::Error> {
        self.probe.log_teardown("device.close");
        Ok(())
    }
}

struct Generator {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SyntheticSession {
    output: FrameProducer<YuvFrame>,
    settings: Settings,
    probe: SyntheticProbe,
    generator: Option<Generator>,
}

impl SyntheticSession {
    fn stop_generator(&mut self) {
        if let Some(generator) = self.generator.take() {
            drop(generator.stop);
            if generator.handle.join().is_err() {
                debug!("synthetic frame generator panicked");
            }
        }
    }
}

impl CaptureSession for SyntheticSession {
    type Error = SyntheticError;

    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), Self::Error> {
        self.probe.lock().last_request = Some(*request);
        if self.settings.faults.reject_repeating {
            return Err(SyntheticError::RequestRejected);
        }
        self.stop_generator();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let output = self.output.clone();
        let probe = self.probe.clone();
        let interval = self.settings.frame_interval;
        let layout = self.settings.layout;
        let handle = spawn_named("synthetic-camera", move || {
            let started = Instant::now();
            let mut sequence = 0u64;
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {
                        let frame = generate(output.resolution(), sequence, layout)
                            .with_timestamp(started.elapsed());
                        sequence += 1;
                        match output.submit(frame) {
                            Ok(()) => {
                                probe.inner.frames.fetch_add(1, Ordering::SeqCst);
                            }
                            Err((SubmitError::Full, _)) => {
                                probe.inner.rejected.fetch_add(1, Ordering::SeqCst);
                            }
                            Err((SubmitError::Closed, _)) => break,
                        }
                    }
                }
            }
            trace!(frames = sequence, "synthetic frame generator stopped");
        })
        .map_err(|_| SyntheticError::Generator)?;

        self.generator = Some(Generator {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), Self::Error> {
        self.probe.log_teardown("session.stop_repeating");
        self.stop_generator();
        Ok(())
    }

    fn close(mut self) -> Result<(), Self::Error> {
        self.probe.log_teardown("session.close");
        self.stop_generator();
        if self.settings.faults.panic_on_session_close {
            panic!("synthetic session failed to close");
        }
        Ok(())
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.stop_generator();
    }
}

/// Build frame `sequence` for `resolution`.
///
/// Luma is a diagonal ramp shifted by the sequence number; U and V are
/// constant per frame so conversions are easy to check.
pub fn generate(resolution: Resolution, sequence: u64, layout: ChromaLayout) -> YuvFrame {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let (chroma_width, chroma_height) = (width / 2, height / 2);
    let shift = sequence as usize;
    let u = (64 + sequence % 64) as u8;
    let v = (192 - sequence % 64) as u8;

    match layout {
        ChromaLayout::Planar => {
            let y = (0..height)
                .flat_map(|r| (0..width).map(move |c| ((r + c + shift) % 256) as u8))
                .collect();
            let chroma = chroma_width * chroma_height;
            YuvFrame::planar(resolution, y, vec![u; chroma], vec![v; chroma])
        }
        ChromaLayout::SemiPlanarVu { row_padding } => {
            let y_stride = width + row_padding;
            let mut y = vec![0u8; y_stride * height];
            for (r, row) in y.chunks_mut(y_stride).enumerate() {
                for (c, sample) in row[..width].iter_mut().enumerate() {
                    *sample = ((r + c + shift) % 256) as u8;
                }
            }
            let vu_stride = chroma_width * 2 + row_padding;
            let mut vu = vec![0u8; vu_stride * chroma_height];
            for row in vu.chunks_mut(vu_stride) {
                for pair in row[..chroma_width * 2].chunks_mut(2) {
                    pair[0] = v;
                    pair[1] = u;
                }
            }
            YuvFrame::semi_planar_vu(resolution, y, y_stride, vu, vu_stride)
        }
    }
}
