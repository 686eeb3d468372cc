mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camera_pipeline::platform::synthetic::{ChromaLayout, SyntheticPreview};
use camera_pipeline::{
    CaptureConfig, DeviceSessionController, FrameProcessor, ProcessingError, ProcessingResult,
    Resolution, SessionState, nv21_len,
};
use common::{TIMEOUT, backend, collector};
use crossbeam_channel::Receiver;

/// Records the last NV21 buffer it saw and echoes its first four bytes.
#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
    last: Mutex<Option<(Vec<u8>, Resolution)>>,
}

impl FrameProcessor for Recorder {
    fn process_frame(&self, nv21: &[u8], resolution: Resolution) -> Result<Vec<u8>, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((nv21.to_vec(), resolution));
        Ok(nv21[..4].to_vec())
    }
}

fn next_matching(
    results: &Receiver<ProcessingResult>,
    pred: impl Fn(&ProcessingResult) -> bool,
) -> ProcessingResult {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = results
            .recv_timeout(remaining)
            .expect("no matching result before timeout");
        if pred(&result) {
            return result;
        }
    }
}

#[test]
fn processing_mode_toggles_while_streaming() {
    let recorder = Arc::new(Recorder::default());
    let controller = DeviceSessionController::new(
        backend(),
        recorder.clone(),
        CaptureConfig::default(),
    )
    .unwrap();
    let (on_frame, results) = collector();

    controller.open(SyntheticPreview::new(), 320, 240, on_frame);
    assert!(controller.wait_for_state(SessionState::Active, TIMEOUT));
    assert!(!controller.processing_enabled());

    let first = results.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.processed_bytes, None);
    assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);

    controller.set_processing_mode(true);
    assert!(controller.processing_enabled());
    let processed = next_matching(&results, |r| r.processed_bytes.is_some());
    assert_eq!(processed.processed_bytes.as_ref().map(Vec::len), Some(4));
    assert_eq!((processed.width, processed.height), (320, 240));

    let (nv21, resolution) = recorder.last.lock().unwrap().clone().unwrap();
    assert_eq!(resolution, Resolution::new(320, 240));
    assert_eq!(nv21.len(), nv21_len(resolution));

    controller.set_processing_mode(false);
    let calls = {
        next_matching(&results, |r| r.processed_bytes.is_none());
        recorder.calls.load(Ordering::SeqCst)
    };
    for _ in 0..3 {
        let result = results.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(result.processed_bytes, None);
        assert_eq!(result.latency_ms, 0);
    }
    assert_eq!(recorder.calls.load(Ordering::SeqCst), calls);
}

#[test]
fn processing_enabled_from_config() {
    let recorder = Arc::new(Recorder::default());
    let config = CaptureConfig {
        processing_enabled: true,
        ..CaptureConfig::default()
    };
    let controller = DeviceSessionController::new(backend(), recorder, config).unwrap();
    let (on_frame, results) = collector();

    controller.open(SyntheticPreview::new(), 640, 480, on_frame);
    let result = results.recv_timeout(TIMEOUT).unwrap();
    assert!(result.processed_bytes.is_some());
}

#[test]
fn padded_semi_planar_frames_convert_to_clean_nv21() {
    let recorder = Arc::new(Recorder::default());
    let config = CaptureConfig {
        processing_enabled: true,
        ..CaptureConfig::default()
    };
    let backend = backend().chroma_layout(ChromaLayout::SemiPlanarVu { row_padding: 12 });
    let controller = DeviceSessionController::new(backend, recorder.clone(), config).unwrap();
    let (on_frame, results) = collector();

    controller.open(SyntheticPreview::new(), 320, 240, on_frame);
    results.recv_timeout(TIMEOUT).unwrap();
    controller.close();

    let (nv21, resolution) = recorder.last.lock().unwrap().clone().unwrap();
    let luma = resolution.pixel_count();
    assert_eq!(nv21.len(), luma + luma / 2);
    // Row 1 of the luma ramp starts one step after row 0, with no padding.
    assert_eq!(nv21[320].wrapping_sub(nv21[0]), 1);
    // Generated chroma always has V + U == 256, so every pair must too.
    assert!(
        nv21[luma..]
            .chunks(2)
            .all(|pair| u16::from(pair[0]) + u16::from(pair[1]) == 256)
    );
}

#[test]
fn failing_processor_never_stops_the_stream() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let processor = move |_: &[u8], _: Resolution| -> Result<Vec<u8>, ProcessingError> {
        if counter.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            panic!("processor crashed");
        }
        Err(ProcessingError::Failed("no detections".into()))
    };
    let config = CaptureConfig {
        processing_enabled: true,
        ..CaptureConfig::default()
    };
    let controller = DeviceSessionController::new(backend(), Arc::new(processor), config).unwrap();
    let (on_frame, results) = collector();

    controller.open(SyntheticPreview::new(), 320, 240, on_frame);
    for _ in 0..4 {
        let result = results.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(result.processed_bytes, None);
    }
    assert_eq!(controller.state(), SessionState::Active);
    assert!(failures.load(Ordering::SeqCst) >= 4);
}

#[test]
fn slow_consumer_drops_frames_instead_of_queueing() {
    let backend = backend().frame_interval(Duration::from_millis(1));
    let probe = backend.probe();
    let controller = DeviceSessionController::new(
        backend,
        Arc::new(camera_pipeline::NoopProcessor),
        CaptureConfig::default(),
    )
    .unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&delivered);

    controller.open(SyntheticPreview::new(), 320, 240, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
    });
    assert!(controller.wait_for_state(SessionState::Active, TIMEOUT));
    std::thread::sleep(Duration::from_millis(300));
    controller.close();

    let delivered = delivered.load(Ordering::SeqCst) as u64;
    assert!(delivered > 0);
    assert!(probe.frames() + probe.rejected_frames() > delivered);
}
