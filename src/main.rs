// =============================================================================
// OFFSCREEN STREAM - Standalone runner
// =============================================================================
//
// Runs one render session on the debug scene for a fixed time and logs what
// a streaming client would have received. Useful for checking a machine's
// Vulkan setup without a network layer in front.
//
// =============================================================================

use anyhow::{Context, Result};
use offscreen_stream::{
    Adapter, CloseReason, Config, DrawSet, FrameSink, MappedFrame, SessionHost, TransformDelta,
};
use std::time::{Duration, Instant};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Initialize logging first so config load warnings are visible
    init_logging();

    // Load configuration from config.toml
    let config = Config::load();
    log::info!("Starting offscreen renderer");
    log::info!(
        "Output: {}x{}, capture at {} fps ({:?})",
        config.output.width,
        config.output.height,
        config.capture.fps,
        config.capture.policy
    );

    let adapter = Adapter::new(&config.device).context("Failed to initialize Vulkan")?;
    log::info!("Using GPU: {}", adapter.device_name());

    let duration = Duration::from_secs_f32(config.demo.duration_seconds.max(0.0));
    let host = SessionHost::new(adapter, config, DrawSet::debug_scene())?;
    let session = host.open(StatsSink::default())?;

    // Stand-in for a client: nudge the scene a little every 100ms
    let started = Instant::now();
    while started.elapsed() < duration && !session.is_finished() {
        session.apply(&TransformDelta {
            rotate_z: 0.05,
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(100));
    }

    let frames = session.stop_and_join()?;
    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "Delivered {} frames in {:.2}s ({:.1} fps)",
        frames,
        elapsed,
        frames as f32 / elapsed.max(f32::EPSILON)
    );
    Ok(())
}

/// Initialize logging (RUST_LOG overrides the default level)
fn init_logging() {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
}

// =============================================================================
// FRAME SINK
// =============================================================================

/// Logs frame statistics instead of encoding and sending them
#[derive(Default)]
struct StatsSink {
    frames: u64,
    bytes: u64,
    last_report: Option<Instant>,
}

impl FrameSink for StatsSink {
    fn deliver(&mut self, frame: &MappedFrame) -> Result<()> {
        let packed = frame.to_packed()?;
        self.frames += 1;
        self.bytes += packed.len() as u64;

        let now = Instant::now();
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= Duration::from_secs(1));
        if due {
            let center = frame.pixel(frame.width() / 2, frame.height() / 2);
            log::info!(
                "Frame {}: {}x{}, row pitch {}, center pixel {:?}",
                self.frames,
                frame.width(),
                frame.height(),
                frame.row_pitch(),
                center
            );
            self.last_report = Some(now);
        }
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::Finished => log::info!(
                "Sink closed: {} frames, {:.1} MiB",
                self.frames,
                self.bytes as f64 / (1024.0 * 1024.0)
            ),
            CloseReason::Failed(message) => log::error!("Sink closed with error: {}", message),
        }
    }
}
