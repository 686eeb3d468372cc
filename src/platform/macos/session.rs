use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use block2::RcBlock;
use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2::{AllocAnyThread, DefinedClass, define_class, msg_send};
use objc2_av_foundation::{
    AVCaptureConnection, AVCaptureDevice, AVCaptureDeviceFormat, AVCaptureDeviceInput,
    AVCaptureOutput, AVCaptureSession, AVCaptureSessionErrorKey,
    AVCaptureSessionRuntimeErrorNotification, AVCaptureVideoDataOutput,
    AVCaptureVideoDataOutputSampleBufferDelegate,
};
use objc2_core_media::CMSampleBuffer;
use objc2_core_video::kCVPixelBufferPixelFormatTypeKey;
use objc2_foundation::{
    NSDictionary, NSError, NSNotification, NSNotificationCenter, NSNumber, NSObjectProtocol,
    NSString,
};
use tracing::trace;

use crate::capture::{CaptureRequest, CaptureSession};
use crate::device::DeviceEvents;
use crate::error::PlatformError;
use crate::platform::macos::catch_objc;
use crate::platform::macos::device::{MacosCameraDevice, ObserverToken, remove_observer};
use crate::platform::macos::ext::{apply_capture_modes, lock_for_configuration};
use crate::platform::macos::frame::{
    FOURCC_420_VIDEO_RANGE, MacosFrame, cm_time_to_duration,
};
use crate::reader::FrameProducer;
use crate::types::Resolution;

/// `AVErrorUnknown`, reported when a runtime error carries no `NSError`.
const AV_ERROR_UNKNOWN: i32 = -11800;

struct DelegateIvars {
    output: Mutex<Option<FrameProducer<MacosFrame>>>,
}

define_class!(
    #[unsafe(super(objc2_foundation::NSObject))]
    #[ivars = DelegateIvars]
    #[name = "CameraPipelineSampleBufferDelegate"]
    struct SampleBufferDelegate;

    impl SampleBufferDelegate {
    }

    unsafe impl NSObjectProtocol for SampleBufferDelegate {}

    unsafe impl AVCaptureVideoDataOutputSampleBufferDelegate for SampleBufferDelegate {
        #[unsafe(method(captureOutput:didOutputSampleBuffer:fromConnection:))]
        #[allow(non_snake_case)]
        unsafe fn captureOutput_didOutputSampleBuffer_fromConnection(
            &self,
            _output: &AVCaptureOutput,
            sample_buffer: &CMSampleBuffer,
            _connection: &AVCaptureConnection,
        ) {
            let Some(pixel_buffer) = (unsafe { sample_buffer.image_buffer() }) else {
                return;
            };
            let timestamp = cm_time_to_duration(unsafe { sample_buffer.presentation_time_stamp() });

            let Some(frame) = MacosFrame::lock(pixel_buffer, timestamp) else {
                trace!("skipping pixel buffer that is not bi-planar 4:2:0");
                return;
            };
            let output = self
                .ivars()
                .output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(output) = output
                && let Err((reason, _frame)) = output.submit(frame)
            {
                trace!(?reason, "frame not accepted by reader");
            }
        }
    }
);

impl SampleBufferDelegate {
    fn new(output: FrameProducer<MacosFrame>) -> Retained<Self> {
        let ivars = DelegateIvars {
            output: Mutex::new(Some(output)),
        };
        let obj = Self::alloc().set_ivars(ivars);
        unsafe { msg_send![super(obj), init] }
    }

    fn detach(&self) {
        *self.ivars().output.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn find_format(
    device: &AVCaptureDevice,
    resolution: Resolution,
) -> Option<Retained<AVCaptureDeviceFormat>> {
    unsafe { device.formats() }.iter().find(|format| {
        let desc = unsafe { format.formatDescription() };
        let sub_type = unsafe { desc.media_sub_type() };
        let dims = unsafe { objc2_core_media::CMVideoFormatDescriptionGetDimensions(&desc) };
        sub_type == FOURCC_420_VIDEO_RANGE
            && dims.width as u32 == resolution.width
            && dims.height as u32 == resolution.height
    })
}

fn runtime_error_code(notification: &NSNotification) -> i32 {
    let Some(info) = (unsafe { notification.userInfo() }) else {
        return AV_ERROR_UNKNOWN;
    };
    let key: &NSString = unsafe { AVCaptureSessionErrorKey };
    let key: &AnyObject = key.as_ref();
    unsafe { info.objectForKey(key) }
        .and_then(|value| value.downcast::<NSError>().ok())
        .map_or(AV_ERROR_UNKNOWN, |e| e.code() as i32)
}

fn observe_runtime_errors(
    session: &AVCaptureSession,
    events: DeviceEvents<MacosCameraDevice>,
) -> ObserverToken {
    let block = RcBlock::new(move |notification: NonNull<NSNotification>| {
        let code = runtime_error_code(unsafe { notification.as_ref() });
        events.error(code);
    });
    let center = NSNotificationCenter::defaultCenter();
    let object: &AnyObject = session.as_ref();
    unsafe {
        center.addObserverForName_object_queue_usingBlock(
            Some(AVCaptureSessionRuntimeErrorNotification),
            Some(object),
            None,
            &block,
        )
    }
}

/// An `AVCaptureSession` delivering bi-planar 4:2:0 frames to a reader.
pub struct MacosCaptureSession {
    session: Retained<AVCaptureSession>,
    device: Retained<AVCaptureDevice>,
    output: Retained<AVCaptureVideoDataOutput>,
    delegate: Option<Retained<SampleBufferDelegate>>,
    error_observer: Option<ObserverToken>,
    /// True while the device config lock is held (between configuration and
    /// the first repeating request).
    config_locked: bool,
    running: bool,
}

// SAFETY: the session is only driven from the controller's control thread;
// AVCaptureSession start/stop and AVCaptureDevice configuration are documented
// as callable off the main thread. Frame delivery happens on the session's own
// dispatch queue and only touches the delegate's mutex-guarded producer.
unsafe impl Send for MacosCaptureSession {}

impl MacosCaptureSession {
    pub(crate) fn new(
        device: &Retained<AVCaptureDevice>,
        input: &AVCaptureDeviceInput,
        frames: FrameProducer<MacosFrame>,
        events: DeviceEvents<MacosCameraDevice>,
    ) -> Result<Self, PlatformError> {
        let resolution = frames.resolution();
        let session = unsafe { AVCaptureSession::new() };
        let output = unsafe { AVCaptureVideoDataOutput::new() };

        // Ask for bi-planar 4:2:0 rather than the output's default (typically
        // UYVY).
        unsafe {
            let key: &NSString = std::mem::transmute::<&objc2_core_foundation::CFString, &NSString>(
                kCVPixelBufferPixelFormatTypeKey,
            );
            let value = NSNumber::new_u32(FOURCC_420_VIDEO_RANGE);
            let settings: Retained<NSDictionary<NSString, AnyObject>> =
                NSDictionary::dictionaryWithObject_forKey(&value, ProtocolObject::from_ref(key));
            output.setVideoSettings(Some(&settings));
            output.setAlwaysDiscardsLateVideoFrames(true);
        }

        let format = find_format(device, resolution).ok_or_else(|| {
            PlatformError::Message(format!("no 4:2:0 device format at {resolution}"))
        })?;

        catch_objc(AssertUnwindSafe(|| unsafe {
            session.beginConfiguration();

            if !session.canAddInput(input) {
                session.commitConfiguration();
                return Err(PlatformError::Message("cannot add input to session".into()));
            }
            session.addInput(input);

            if !session.canAddOutput(&output) {
                session.commitConfiguration();
                return Err(PlatformError::Message("cannot add output to session".into()));
            }
            session.addOutput(&output);

            session.commitConfiguration();
            Ok::<(), PlatformError>(())
        }))??;

        // The lock is held until the session is running; unlocking earlier
        // lets the session preset override the active format.
        unsafe { device.lockForConfiguration() }
            .map_err(|e| PlatformError::Message(e.to_string()))?;
        if let Err(e) = catch_objc(AssertUnwindSafe(|| unsafe { device.setActiveFormat(&format) })) {
            unsafe { device.unlockForConfiguration() };
            return Err(e);
        }

        let delegate = SampleBufferDelegate::new(frames);
        let queue = dispatch2::DispatchQueue::new(
            "camera-pipeline.frames",
            dispatch2::DispatchQueueAttr::SERIAL,
        );
        unsafe {
            output.setSampleBufferDelegate_queue(
                Some(ProtocolObject::from_ref(&*delegate)),
                Some(&queue),
            );
        }
        let error_observer = observe_runtime_errors(&session, events);

        Ok(MacosCaptureSession {
            session,
            device: device.clone(),
            output,
            delegate: Some(delegate),
            error_observer: Some(error_observer),
            config_locked: true,
            running: false,
        })
    }

    /// Access the underlying `AVCaptureSession`.
    pub fn av_session(&self) -> &AVCaptureSession {
        &self.session
    }

    fn release(&mut self) {
        if self.running {
            unsafe { self.session.stopRunning() };
            self.running = false;
        }
        unsafe { self.output.setSampleBufferDelegate_queue(None, None) };
        if let Some(delegate) = self.delegate.take() {
            delegate.detach();
        }
        if let Some(token) = self.error_observer.take() {
            remove_observer(&token);
        }
        if self.config_locked {
            unsafe { self.device.unlockForConfiguration() };
            self.config_locked = false;
        }
    }
}

impl CaptureSession for MacosCaptureSession {
    type Error = PlatformError;

    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<(), Self::Error> {
        if self.config_locked {
            apply_capture_modes(&self.device, request)?;
        } else {
            let guard = lock_for_configuration(&self.device)?;
            apply_capture_modes(guard.device(), request)?;
        }

        if !self.running {
            catch_objc(AssertUnwindSafe(|| unsafe { self.session.startRunning() }))?;
            self.running = true;
        }

        // The active format sticks once the session runs.
        if self.config_locked {
            unsafe { self.device.unlockForConfiguration() };
            self.config_locked = false;
        }
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<(), Self::Error> {
        if self.running {
            catch_objc(AssertUnwindSafe(|| unsafe { self.session.stopRunning() }))?;
            self.running = false;
        }
        Ok(())
    }

    fn close(mut self) -> Result<(), Self::Error> {
        self.release();
        Ok(())
    }
}

impl Drop for MacosCaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}
