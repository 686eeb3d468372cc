//! Camera session lifecycle.
//!
//! [`DeviceSessionController`] is a handle to a control thread that owns the
//! backend and every per-session resource. Caller requests and backend
//! events are both fed to that thread over channels, so the session record
//! has a single writer; the handle only reads a published copy of the state.
//!
//! ```text
//! Closed -> Opening -> Configuring -> Active
//!              \            \
//!               +-> Error <--+-> Closed
//! any non-Closed state -- close() --> Closing -> Closed
//! ```

use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionWorker, FrameAcquisitionLoop, on_frame_worker};
use crate::capture::{CaptureRequest, CaptureSession};
use crate::config::CaptureConfig;
use crate::device::{CameraDevice, CameraManager, DeviceEvent, DeviceEvents, PreviewTarget, StampedEvent};
use crate::dispatch::{ProcessingDispatcher, ProcessingFlag, ProcessingMode, ProcessingResult};
use crate::error::Error;
use crate::processor::FrameProcessor;
use crate::reader::FrameReader;
use crate::types::{LensFacing, PixelFormat, Resolution, select_resolution};
use crate::{panic_message, spawn_named};

const CONTROL_THREAD_NAME: &str = "camera-session";

type DeviceOf<B> = <B as CameraManager>::Device;
type PreviewOf<B> = <DeviceOf<B> as CameraDevice>::Preview;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Configuring,
    Active,
    Closing,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Configuring => "configuring",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Error => "error",
        })
    }
}

struct Published {
    state: SessionState,
    last_error: Option<Arc<Error>>,
    subscribers: Vec<Sender<SessionState>>,
}

/// State mirror shared between the control thread and the handle.
struct StateCell {
    inner: Mutex<Published>,
    changed: Condvar,
}

impl StateCell {
    fn new() -> Self {
        StateCell {
            inner: Mutex::new(Published {
                state: SessionState::Closed,
                last_error: None,
                subscribers: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: SessionState) {
        let mut inner = self.lock();
        inner.state = state;
        inner.subscribers.retain(|s| s.send(state).is_ok());
        drop(inner);
        self.changed.notify_all();
    }

    fn record_error(&self, error: Error) {
        self.lock().last_error = Some(Arc::new(error));
    }

    fn wait_for(&self, target: SessionState, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |p| p.state != target)
            .unwrap_or_else(PoisonError::into_inner);
        guard.state == target
    }
}

enum Command<P> {
    Open {
        preview: P,
        width: u32,
        height: u32,
        on_frame: Box<dyn FnMut(ProcessingResult) + Send + 'static>,
    },
    Close {
        done: Sender<()>,
    },
    Shutdown,
}

/// Opens a camera, streams frames through the processing pipeline and tears
/// everything down again.
///
/// All methods return without waiting on the camera except
/// [`close`](Self::close), which blocks until teardown has finished when
/// called from outside a frame callback. Failures
/// never surface as panics or errors to the caller: they are logged, the
/// session moves to [`SessionState::Closed`], and the cause is kept in
/// [`last_error`](Self::last_error).
pub struct DeviceSessionController<B: CameraManager> {
    commands: Sender<Command<PreviewOf<B>>>,
    state: Arc<StateCell>,
    mode: ProcessingMode,
    thread: Option<JoinHandle<()>>,
}

impl<B: CameraManager> DeviceSessionController<B> {
    pub fn new(
        backend: B,
        processor: Arc<dyn FrameProcessor>,
        config: CaptureConfig,
    ) -> Result<Self, Error> {
        config.validate()?;

        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let state = Arc::new(StateCell::new());
        let mode = ProcessingMode::new(config.processing_enabled);

        let controller = Controller {
            backend,
            processor,
            mode: mode.flag(),
            config,
            state: Arc::clone(&state),
            events: events_tx,
            attempt: 0,
            current: SessionState::Closed,
            active: None,
        };
        let thread = spawn_named(CONTROL_THREAD_NAME, move || {
            controller.run(commands_rx, events_rx)
        })?;

        Ok(DeviceSessionController {
            commands: commands_tx,
            state,
            mode,
            thread: Some(thread),
        })
    }

    /// Start a session delivering frames near `width` x `height` to `on_frame`.
    ///
    /// An existing session is closed first. Progress is observable through
    /// [`state`](Self::state) and [`subscribe`](Self::subscribe).
    pub fn open<F>(&self, preview: PreviewOf<B>, width: u32, height: u32, on_frame: F)
    where
        F: FnMut(ProcessingResult) + Send + 'static,
    {
        let command = Command::Open {
            preview,
            width,
            height,
            on_frame: Box::new(on_frame),
        };
        if self.commands.send(command).is_err() {
            error!("camera control thread is gone; open ignored");
        }
    }

    /// Tear down the current session, if any, and wait until it is closed.
    ///
    /// Called from inside a frame callback, the close is only requested:
    /// teardown joins the frame worker, so it cannot finish until the
    /// callback returns. Watch for [`SessionState::Closed`] instead.
    pub fn close(&self) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::Close { done: done_tx }).is_err() {
            return;
        }
        if on_frame_worker() {
            debug!("close requested from a frame callback");
            return;
        }
        // A disconnect means the control thread exited; nothing left to wait on.
        let _ = done_rx.recv();
    }

    /// Turn frame processing on or off, from the next delivered frame.
    pub fn set_processing_mode(&self, enabled: bool) {
        self.mode.set(enabled);
        debug!(enabled, "processing mode changed");
    }

    pub fn processing_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state
    }

    /// Block until the session reaches `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        self.state.wait_for(state, timeout)
    }

    /// Receive every state published from now on.
    pub fn subscribe(&self) -> Receiver<SessionState> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// The failure that most recently ended or prevented a session.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.state.lock().last_error.clone()
    }
}

impl<B: CameraManager> Drop for DeviceSessionController<B> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        let Some(thread) = self.thread.take() else {
            return;
        };
        if on_frame_worker() {
            // The control thread joins this worker during teardown; let it
            // finish on its own.
            debug!("controller dropped from a frame callback; not waiting for shutdown");
            return;
        }
        if let Err(payload) = thread.join() {
            error!(panic = %panic_message(&*payload), "camera control thread panicked");
        }
    }
}

/// Resources belonging to one open attempt.
struct ActiveSession<D: CameraDevice> {
    resolution: Resolution,
    preview: D::Preview,
    reader: FrameReader<D::Frame>,
    worker: AcquisitionWorker,
    device: Option<D>,
    session: Option<D::Session>,
}

struct Controller<B: CameraManager> {
    backend: B,
    processor: Arc<dyn FrameProcessor>,
    mode: ProcessingFlag,
    config: CaptureConfig,
    state: Arc<StateCell>,
    events: Sender<StampedEvent<DeviceOf<B>>>,
    attempt: u64,
    current: SessionState,
    active: Option<ActiveSession<DeviceOf<B>>>,
}

impl<B: CameraManager> Controller<B> {
    fn run(
        mut self,
        commands: Receiver<Command<PreviewOf<B>>>,
        events: Receiver<StampedEvent<DeviceOf<B>>>,
    ) {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Open { preview, width, height, on_frame }) => {
                        self.open(preview, width, height, on_frame);
                    }
                    Ok(Command::Close { done }) => {
                        self.close();
                        let _ = done.send(());
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.handle_event(event);
                    }
                }
            }
        }
        self.close();
        // Release whatever backends reported after the last session ended.
        while let Ok(stale) = events.try_recv() {
            stale.event.discard();
        }
        debug!("camera control thread stopped");
    }

    fn open(
        &mut self,
        mut preview: PreviewOf<B>,
        width: u32,
        height: u32,
        on_frame: Box<dyn FnMut(ProcessingResult) + Send + 'static>,
    ) {
        if self.current != SessionState::Closed {
            info!(state = %self.current, "closing current session before reopening");
            self.close();
        }
        self.attempt += 1;

        let facing = self.config.lens_facing;
        let id = match self.find_camera(facing) {
            Ok(id) => id,
            Err(e) => return self.reject(e),
        };
        let resolution = match self.negotiate_resolution(&id, width, height) {
            Ok(resolution) => resolution,
            Err(e) => return self.reject(e),
        };
        info!(camera = %id, %resolution, requested_width = width, requested_height = height, "selected capture size");
        preview.set_default_buffer_size(resolution);

        let (reader, signals) = FrameReader::new(resolution, self.config.buffer_pool_depth);
        let dispatcher = ProcessingDispatcher::new(Arc::clone(&self.processor), self.mode.clone(), on_frame);
        let acquisition = FrameAcquisitionLoop::new(reader.clone(), dispatcher);
        let worker = match AcquisitionWorker::spawn(&self.config.worker_thread_name, acquisition, signals) {
            Ok(worker) => worker,
            Err(e) => {
                reader.close();
                return self.reject(e);
            }
        };
        self.active = Some(ActiveSession {
            resolution,
            preview,
            reader,
            worker,
            device: None,
            session: None,
        });

        if !self.backend.camera_permission_granted() {
            self.teardown();
            return self.reject(Error::PermissionDenied);
        }

        self.transition(SessionState::Opening);
        let events = DeviceEvents::new(self.attempt, self.events.clone());
        if let Err(e) = self.backend.open_device(&id, events) {
            self.fail(Error::device_access(e));
        }
    }

    fn find_camera(&self, facing: LensFacing) -> Result<String, Error> {
        let ids = self.backend.device_ids().map_err(Error::device_access)?;
        for id in ids {
            match self.backend.lens_facing(&id) {
                Ok(f) if f == facing => return Ok(id),
                Ok(_) => {}
                Err(e) => warn!(camera = %id, error = %e, "skipping camera with unknown facing"),
            }
        }
        Err(Error::NoMatchingDevice(facing))
    }

    fn negotiate_resolution(&self, id: &str, width: u32, height: u32) -> Result<Resolution, Error> {
        let sizes = self
            .backend
            .output_sizes(id, PixelFormat::Yuv420)
            .map_err(Error::configuration)?;
        select_resolution(&sizes, width, height)
            .ok_or_else(|| Error::configuration(format!("camera {id} reports no output sizes")))
    }

    fn handle_event(&mut self, stamped: StampedEvent<DeviceOf<B>>) {
        let StampedEvent { attempt, event } = stamped;
        if attempt != self.attempt || self.active.is_none() {
            warn!(attempt, current = self.attempt, kind = event.kind(), "ignoring event from a superseded session");
            event.discard();
            return;
        }

        let outcome = match (self.current, event) {
            (SessionState::Opening, DeviceEvent::Opened(device)) => self.on_opened(device),
            (SessionState::Configuring, DeviceEvent::SessionConfigured(session)) => {
                self.on_session_configured(session)
            }
            (SessionState::Configuring, DeviceEvent::SessionConfigureFailed(reason)) => {
                Err(Error::ConfigurationFailure(reason))
            }
            (_, DeviceEvent::Disconnected) => Err(Error::DeviceDisconnected),
            (_, DeviceEvent::Error(code)) => Err(Error::Device(code)),
            (state, unexpected) => {
                let kind = unexpected.kind();
                unexpected.discard();
                Err(Error::ConfigurationFailure(format!(
                    "unexpected {kind} event while {state}"
                )))
            }
        };
        if let Err(e) = outcome {
            self.fail(e);
        }
    }

    fn on_opened(&mut self, mut device: DeviceOf<B>) -> Result<(), Error> {
        info!(camera = device.id(), "camera opened");
        self.transition(SessionState::Configuring);
        let events = DeviceEvents::new(self.attempt, self.events.clone());
        let Some(active) = self.active.as_mut() else {
            DeviceEvent::Opened(device).discard();
            return Ok(());
        };
        let result = device.create_capture_session(&mut active.preview, active.reader.producer(), events);
        active.device = Some(device);
        result.map_err(Error::configuration)
    }

    fn on_session_configured(
        &mut self,
        session: <DeviceOf<B> as CameraDevice>::Session,
    ) -> Result<(), Error> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let request = CaptureRequest {
            resolution: active.resolution,
            autofocus: self.config.autofocus,
            auto_exposure: self.config.auto_exposure,
        };
        let session = active.session.insert(session);
        session
            .set_repeating_request(&request)
            .map_err(Error::configuration)?;
        self.transition(SessionState::Active);
        Ok(())
    }

    fn close(&mut self) {
        if self.current == SessionState::Closed && self.active.is_none() {
            return;
        }
        self.transition(SessionState::Closing);
        self.teardown();
        self.transition(SessionState::Closed);
    }

    /// The open never got past setup; the state is still `Closed`.
    fn reject(&mut self, e: Error) {
        error!(error = %e, "camera session not opened");
        self.state.record_error(e);
    }

    /// Fail closed: report, release everything, end in `Closed`.
    fn fail(&mut self, e: Error) {
        match &e {
            Error::Device(code) => error!(code, state = %self.current, "camera device error"),
            _ => error!(error = %e, state = %self.current, "camera session failed"),
        }
        self.state.record_error(e);
        self.transition(SessionState::Error);
        self.teardown();
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, to: SessionState) {
        if self.current != to {
            info!(from = %self.current, %to, "session state");
        }
        self.current = to;
        self.state.publish(to);
    }

    /// Release session resources in a fixed order. A failing step is
    /// logged and the remaining steps still run.
    fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveSession {
            preview,
            reader,
            worker,
            device,
            session,
            ..
        } = active;

        if let Some(mut session) = session {
            contained("stop repeating request", || session.stop_repeating());
            contained("close capture session", move || session.close());
        }
        if let Some(device) = device {
            contained("close camera device", move || device.close());
        }
        contained("close frame reader", || {
            reader.close();
            Ok::<(), Infallible>(())
        });
        contained("stop frame worker", || {
            if let Some(stats) = worker.stop() {
                debug!(served = stats.served, dropped = reader.stats().dropped, "session frames");
            }
            Ok::<(), Infallible>(())
        });
        drop(preview);
    }
}

/// Run one teardown step, logging errors and panics instead of propagating.
fn contained<E, F>(step: &'static str, f: F)
where
    E: fmt::Display,
    F: FnOnce() -> Result<(), E>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => debug!(step, "teardown step finished"),
        Ok(Err(e)) => warn!(step, error = %e, "teardown step failed"),
        Err(payload) => warn!(step, panic = %panic_message(&*payload), "teardown step panicked"),
    }
}
