//! Open a camera, stream for a few seconds with processing toggled halfway,
//! then close.
//!
//! ```text
//! cargo run --example capture -- [config.toml]
//! ```
//!
//! On macOS the built-in camera is used unless `CAMERA_PIPELINE_SYNTHETIC`
//! is set; elsewhere frames come from the synthetic backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camera_pipeline::platform::synthetic::{SyntheticBackend, SyntheticPreview};
use camera_pipeline::{
    CameraDevice, CameraManager, CaptureConfig, DeviceSessionController, ProcessingError,
    Resolution, SessionState,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// Stand-in for a native detector: mean luma of the frame.
fn mean_luma(nv21: &[u8], resolution: Resolution) -> Result<Vec<u8>, ProcessingError> {
    let luma = &nv21[..resolution.pixel_count()];
    if luma.is_empty() {
        return Err(ProcessingError::InvalidInput("empty frame"));
    }
    let sum: u64 = luma.iter().map(|&b| u64::from(b)).sum();
    Ok(vec![(sum / luma.len() as u64) as u8])
}

fn run<B: CameraManager>(
    backend: B,
    preview: <B::Device as CameraDevice>::Preview,
    config: CaptureConfig,
) -> Result<(), camera_pipeline::Error> {
    let controller = DeviceSessionController::new(backend, Arc::new(mean_luma), config)?;
    let states = controller.subscribe();

    let mut frames = 0u64;
    controller.open(preview, WIDTH, HEIGHT, move |result| {
        frames += 1;
        if frames % 30 == 1 {
            println!(
                "frame {frames}: {}x{} latency={}ms output={:?}",
                result.width, result.height, result.latency_ms, result.processed_bytes,
            );
        }
    });

    if !controller.wait_for_state(SessionState::Active, Duration::from_secs(5)) {
        println!("camera did not start: {:?}", controller.last_error());
        return Ok(());
    }

    std::thread::sleep(Duration::from_secs(2));
    let enabled = !controller.processing_enabled();
    println!("processing {}", if enabled { "on" } else { "off" });
    controller.set_processing_mode(enabled);
    std::thread::sleep(Duration::from_secs(2));

    controller.close();
    let seen: Vec<_> = states.try_iter().map(|s| s.to_string()).collect();
    println!("states: {}", seen.join(" -> "));
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    #[cfg_attr(not(target_os = "macos"), allow(unused_mut))]
    let mut config = CaptureConfig::load(path.as_deref())?;

    #[cfg(target_os = "macos")]
    if std::env::var_os("CAMERA_PIPELINE_SYNTHETIC").is_none() {
        use camera_pipeline::platform::macos::{MacosCameraManager, MacosPreviewTarget};

        let manager = MacosCameraManager::default();
        // Built-in Mac cameras rarely report a back position.
        if path.is_none()
            && let Some(id) = manager.device_ids()?.first()
        {
            config.lens_facing = manager.lens_facing(id)?;
        }
        let preview = MacosPreviewTarget::new(|_, size| println!("preview sized to {size}"));
        run(manager, preview, config)?;
        return Ok(());
    }

    run(SyntheticBackend::with_default_cameras(), SyntheticPreview::new(), config)?;
    Ok(())
}
