use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{trace, warn};

use crate::convert::frame_to_nv21;
use crate::frame::Frame;
use crate::panic_message;
use crate::processor::{FrameProcessor, ProcessingError};

/// Outcome of one delivered frame, handed to the caller's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    /// Wall-clock time spent inside the processor call, in whole
    /// milliseconds.
    ///
    /// NV21 conversion is not included. The value is 0 when processing is
    /// off or the frame could not be converted. The full per-frame cost is
    /// tracked in [`LoopStats::busy`](crate::acquisition::LoopStats::busy).
    pub latency_ms: u64,
    /// Processor output, absent when processing is off or failed.
    pub processed_bytes: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

/// Callback receiving one [`ProcessingResult`] per delivered frame.
pub type FrameCallback = Box<dyn FnMut(ProcessingResult) + Send + 'static>;

/// Writable processing switch, owned by the session controller.
#[derive(Debug, Default)]
pub struct ProcessingMode(Arc<AtomicBool>);

impl ProcessingMode {
    pub fn new(enabled: bool) -> Self {
        ProcessingMode(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Read-only view for the frame worker.
    pub fn flag(&self) -> ProcessingFlag {
        ProcessingFlag(Arc::clone(&self.0))
    }
}

/// Read-only view of a [`ProcessingMode`].
#[derive(Debug, Clone)]
pub struct ProcessingFlag(Arc<AtomicBool>);

impl ProcessingFlag {
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Converts frames, runs the processor when enabled, and reports results.
///
/// Nothing the processor does (error or panic) escapes `dispatch`; a failed
/// frame is reported with no processed bytes and the pipeline carries on.
pub struct ProcessingDispatcher {
    processor: Arc<dyn FrameProcessor>,
    mode: ProcessingFlag,
    callback: FrameCallback,
}

impl ProcessingDispatcher {
    pub fn new(
        processor: Arc<dyn FrameProcessor>,
        mode: ProcessingFlag,
        callback: FrameCallback,
    ) -> Self {
        ProcessingDispatcher {
            processor,
            mode,
            callback,
        }
    }

    /// Process one frame and invoke the callback on the calling thread.
    pub fn dispatch<F: Frame + ?Sized>(&mut self, frame: &F) {
        let result = self.prepare(frame);
        self.deliver(result);
    }

    /// Convert and, when enabled, process a frame.
    ///
    /// This is the only part of dispatch that reads the frame, so the caller
    /// can release it before [`deliver`](Self::deliver).
    pub fn prepare<F: Frame + ?Sized>(&self, frame: &F) -> ProcessingResult {
        let resolution = frame.resolution();
        let (latency_ms, processed_bytes) = if self.mode.is_enabled() {
            self.process(frame)
        } else {
            (0, None)
        };
        ProcessingResult {
            latency_ms,
            processed_bytes,
            width: resolution.width,
            height: resolution.height,
        }
    }

    /// Hand a prepared result to the caller's callback.
    pub fn deliver(&mut self, result: ProcessingResult) {
        (self.callback)(result);
    }

    fn process<F: Frame + ?Sized>(&self, frame: &F) -> (u64, Option<Vec<u8>>) {
        let resolution = frame.resolution();
        let nv21 = match frame_to_nv21(frame) {
            Ok(nv21) => nv21,
            Err(e) => {
                warn!(error = %e, %resolution, "frame conversion failed");
                return (0, None);
            }
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.processor.process_frame(&nv21, resolution)
        }))
        .unwrap_or_else(|payload| Err(ProcessingError::Panicked(panic_message(&*payload))));
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(bytes) => {
                trace!(latency_ms, len = bytes.len(), "frame processed");
                (latency_ms, Some(bytes))
            }
            Err(e) => {
                warn!(error = %e, latency_ms, "frame processing failed");
                (latency_ms, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::YuvFrame;
    use crate::types::Resolution;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn frame() -> YuvFrame {
        YuvFrame::planar(
            Resolution::new(4, 2),
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            vec![30, 40],
            vec![10, 20],
        )
    }

    fn collector() -> (Arc<Mutex<Vec<ProcessingResult>>>, FrameCallback) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let callback: FrameCallback = Box::new(move |r| sink.lock().unwrap().push(r));
        (results, callback)
    }

    struct Counting {
        calls: AtomicUsize,
        seen: Mutex<Option<Vec<u8>>>,
    }

    impl FrameProcessor for Counting {
        fn process_frame(
            &self,
            nv21: &[u8],
            _: Resolution,
        ) -> Result<Vec<u8>, ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = Some(nv21.to_vec());
            Ok(vec![0xAB])
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(None),
        })
    }

    #[test]
    fn disabled_mode_skips_processor() {
        let processor = counting();
        let mode = ProcessingMode::new(false);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(processor.clone(), mode.flag(), callback);

        dispatcher.dispatch(&frame());
        dispatcher.dispatch(&frame());

        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        for r in results.iter() {
            assert_eq!(r.processed_bytes, None);
            assert_eq!(r.latency_ms, 0);
            assert_eq!((r.width, r.height), (4, 2));
        }
    }

    #[test]
    fn enabled_mode_forwards_nv21() {
        let processor = counting();
        let mode = ProcessingMode::new(true);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(processor.clone(), mode.flag(), callback);

        dispatcher.dispatch(&frame());

        assert_eq!(
            processor.seen.lock().unwrap().as_deref(),
            Some(&[1, 2, 3, 4, 5, 6, 7, 8, 10, 30, 20, 40][..])
        );
        assert_eq!(
            results.lock().unwrap()[0].processed_bytes,
            Some(vec![0xAB])
        );
    }

    #[test]
    fn prepare_does_not_call_back_until_delivered() {
        let processor = counting();
        let mode = ProcessingMode::new(true);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(processor.clone(), mode.flag(), callback);

        let prepared = {
            let frame = frame();
            dispatcher.prepare(&frame)
        };
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(results.lock().unwrap().is_empty());

        dispatcher.deliver(prepared);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].processed_bytes, Some(vec![0xAB]));
        assert_eq!((results[0].width, results[0].height), (4, 2));
    }

    #[test]
    fn mode_change_applies_to_next_frame() {
        let processor = counting();
        let mode = ProcessingMode::new(false);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(processor.clone(), mode.flag(), callback);

        dispatcher.dispatch(&frame());
        mode.set(true);
        dispatcher.dispatch(&frame());

        let results = results.lock().unwrap();
        assert_eq!(results[0].processed_bytes, None);
        assert_eq!(results[1].processed_bytes, Some(vec![0xAB]));
    }

    #[test]
    fn processor_error_yields_no_bytes() {
        let failing = |_: &[u8], _: Resolution| -> Result<Vec<u8>, ProcessingError> {
            Err(ProcessingError::Failed("boom".into()))
        };
        let mode = ProcessingMode::new(true);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(Arc::new(failing), mode.flag(), callback);

        dispatcher.dispatch(&frame());

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].processed_bytes, None);
    }

    #[test]
    fn processor_panic_is_contained() {
        let panicking = |_: &[u8], _: Resolution| -> Result<Vec<u8>, ProcessingError> {
            panic!("native routine blew up")
        };
        let mode = ProcessingMode::new(true);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(Arc::new(panicking), mode.flag(), callback);

        dispatcher.dispatch(&frame());
        dispatcher.dispatch(&frame());

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.processed_bytes.is_none()));
    }

    #[test]
    fn unconvertible_frame_yields_no_bytes() {
        let processor = counting();
        let mode = ProcessingMode::new(true);
        let (results, callback) = collector();
        let mut dispatcher = ProcessingDispatcher::new(processor.clone(), mode.flag(), callback);

        // Luma plane one byte short.
        let short = YuvFrame::planar(Resolution::new(4, 2), vec![0; 7], vec![0; 2], vec![0; 2]);
        dispatcher.dispatch(&short);

        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(results.lock().unwrap()[0].processed_bytes, None);
    }
}
