//! The serial frame worker.
//!
//! One thread services every ready signal: it acquires the newest frame,
//! converts and processes it, releases it, and only then hands the result to
//! the caller's callback. Frames are released on every path out of an
//! iteration, including a panic inside the processor or the callback.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, trace};

use crate::dispatch::ProcessingDispatcher;
use crate::error::Error;
use crate::frame::Frame;
use crate::reader::FrameReader;
use crate::{panic_message, spawn_named};

/// What a worker did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Frames acquired and dispatched.
    pub served: u64,
    /// Signals that found no frame to acquire.
    pub idle_signals: u64,
    /// Iterations that panicked.
    pub panics: u64,
    /// Time spent servicing frames, from acquisition until the callback
    /// returned.
    pub busy: Duration,
}

thread_local! {
    static FRAME_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is an [`AcquisitionWorker`], i.e. whether we
/// are inside a frame callback.
pub(crate) fn on_frame_worker() -> bool {
    FRAME_WORKER.with(Cell::get)
}

pub struct FrameAcquisitionLoop<F> {
    reader: FrameReader<F>,
    dispatcher: ProcessingDispatcher,
    stats: LoopStats,
}

impl<F: Frame> FrameAcquisitionLoop<F> {
    pub fn new(reader: FrameReader<F>, dispatcher: ProcessingDispatcher) -> Self {
        FrameAcquisitionLoop {
            reader,
            dispatcher,
            stats: LoopStats::default(),
        }
    }

    /// Service one ready signal.
    ///
    /// Returns `true` when a frame was acquired and dispatched. A signal
    /// with nothing pending is a no-op.
    pub fn on_frame_available(&mut self) -> bool {
        let Some(frame) = self.reader.acquire_latest() else {
            self.stats.idle_signals += 1;
            return false;
        };

        let start = Instant::now();
        let dispatcher = &self.dispatcher;
        let prepared = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.prepare(&*frame)));
        drop(frame);
        let outcome = prepared.and_then(|result| {
            let dispatcher = &mut self.dispatcher;
            panic::catch_unwind(AssertUnwindSafe(|| dispatcher.deliver(result)))
        });
        let elapsed = start.elapsed();

        self.stats.served += 1;
        self.stats.busy += elapsed;
        if let Err(payload) = outcome {
            self.stats.panics += 1;
            error!(panic = %panic_message(&*payload), "frame dispatch panicked");
        }
        trace!(elapsed_us = elapsed.as_micros() as u64, "frame serviced");
        true
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Serve signals until `shutdown` fires or every signal sender is gone.
    pub fn run(mut self, signals: Receiver<()>, shutdown: Receiver<()>) -> LoopStats {
        loop {
            select! {
                recv(signals) -> msg => match msg {
                    Ok(()) => {
                        self.on_frame_available();
                    }
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!(
            served = self.stats.served,
            idle_signals = self.stats.idle_signals,
            panics = self.stats.panics,
            busy_ms = self.stats.busy.as_millis() as u64,
            "frame worker stopped"
        );
        self.stats
    }
}

/// Handle to a running [`FrameAcquisitionLoop`] thread.
pub struct AcquisitionWorker {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<LoopStats>>,
}

impl AcquisitionWorker {
    pub fn spawn<F>(
        name: &str,
        acquisition: FrameAcquisitionLoop<F>,
        signals: Receiver<()>,
    ) -> Result<Self, Error>
    where
        F: Frame + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let handle = spawn_named(name, move || {
            FRAME_WORKER.with(|w| w.set(true));
            acquisition.run(signals, shutdown_rx)
        })?;
        Ok(AcquisitionWorker {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it to finish its current frame.
    pub fn stop(mut self) -> Option<LoopStats> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Option<LoopStats> {
        drop(self.shutdown.take());
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(stats) => Some(stats),
            Err(payload) => {
                error!(panic = %panic_message(&*payload), "frame worker panicked");
                None
            }
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
