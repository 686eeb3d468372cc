#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camera_pipeline::platform::synthetic::{SyntheticBackend, SyntheticCamera};
use camera_pipeline::{LensFacing, ProcessingResult, Resolution, SessionState};
use crossbeam_channel::Receiver;
use tracing::subscriber::DefaultGuard;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Counts ERROR events seen by the subscriber it is installed in.
#[derive(Clone, Default)]
pub struct ErrorCounter(Arc<AtomicUsize>);

impl ErrorCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Records, in order, every teardown step the controller completed.
#[derive(Clone, Default)]
pub struct TeardownSteps(Arc<Mutex<Vec<String>>>);

#[derive(Default)]
struct StepVisitor {
    step: Option<String>,
    finished: bool,
}

impl Visit for StepVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "step" {
            self.step = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.finished = format!("{value:?}") == "teardown step finished";
        }
    }
}

impl<S: Subscriber> Layer<S> for TeardownSteps {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StepVisitor::default();
        event.record(&mut visitor);
        if let (true, Some(step)) = (visitor.finished, visitor.step) {
            self.0.lock().unwrap().push(step);
        }
    }
}

/// What a scoped subscriber saw. Dropping it uninstalls the subscriber.
pub struct Logs {
    errors: ErrorCounter,
    teardown: TeardownSteps,
    _guard: DefaultGuard,
}

impl Logs {
    pub fn error_count(&self) -> usize {
        self.errors.count()
    }

    pub fn teardown_steps(&self) -> Vec<String> {
        self.teardown.0.lock().unwrap().clone()
    }
}

/// Install a subscriber for this thread (and threads the crate spawns from
/// it) that counts errors, records teardown steps and prints according to
/// `RUST_LOG`.
pub fn capture_logs() -> Logs {
    let errors = ErrorCounter::default();
    let teardown = TeardownSteps::default();
    let subscriber = tracing_subscriber::registry()
        .with(errors.clone())
        .with(teardown.clone())
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
                ),
        );
    let _guard = tracing::subscriber::set_default(subscriber);
    Logs {
        errors,
        teardown,
        _guard,
    }
}

/// A back camera offering 640x480 and 320x240, and a front camera offering
/// only 160x120, producing a frame every 2ms.
pub fn backend() -> SyntheticBackend {
    SyntheticBackend::new()
        .camera(SyntheticCamera::new(
            "0",
            LensFacing::Back,
            [Resolution::new(640, 480), Resolution::new(320, 240)],
        ))
        .camera(SyntheticCamera::new(
            "1",
            LensFacing::Front,
            [Resolution::new(160, 120)],
        ))
        .frame_interval(Duration::from_millis(2))
}

/// Frame callback forwarding every result to the returned receiver.
pub fn collector() -> (
    impl FnMut(ProcessingResult) + Send + 'static,
    Receiver<ProcessingResult>,
) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let callback = move |result: ProcessingResult| {
        let _ = tx.send(result);
    };
    (callback, rx)
}

/// Collect published states up to and including `last`.
pub fn states_until(rx: &Receiver<SessionState>, last: SessionState) -> Vec<SessionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.recv_timeout(TIMEOUT) {
        seen.push(state);
        if state == last {
            break;
        }
    }
    seen
}
