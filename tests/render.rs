// GPU integration tests
//
// These need a Vulkan device and the compiled shaders. When either is
// missing, each test logs why and returns early.

use ash::vk;
use offscreen_stream::{
    Adapter, CloseReason, Config, DeviceContext, DrawSet, Engine, FrameSink, MappedFrame, Primitive,
    RenderError, ResourceUploader, SessionHost, TransformDelta, Vertex,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

fn test_config() -> Config {
    let mut config = Config::default();
    config.output.width = 64;
    config.output.height = 48;
    config
}

fn gpu_context(config: &Config) -> Option<Arc<DeviceContext>> {
    let _ = env_logger::builder().is_test(true).try_init();

    if !config.shaders.vertex.exists() || !config.shaders.fragment.exists() {
        log::warn!("Skipping: compiled shaders not found (is glslc installed?)");
        return None;
    }

    let adapter = match Adapter::new(&config.device) {
        Ok(adapter) => adapter,
        Err(e) => {
            log::warn!("Skipping: no Vulkan device ({:#})", e);
            return None;
        }
    };

    match DeviceContext::new(adapter, config.device.use_transfer_queue) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            log::warn!("Skipping: failed to create device ({:#})", e);
            None
        }
    }
}

fn all_pixels(frame: &MappedFrame) -> Vec<[u8; 4]> {
    frame
        .to_packed()
        .unwrap()
        .chunks_exact(4)
        .map(|px| [px[0], px[1], px[2], px[3]])
        .collect()
}

#[test]
fn uploaded_buffer_reads_back_identical() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let uploader = ResourceUploader::new(ctx);
    let vertices = DrawSet::debug_scene().vertices;
    let buffer = uploader
        .upload_slice("test vertices", vk::BufferUsageFlags::VERTEX_BUFFER, &vertices)
        .unwrap();

    let bytes = uploader.download(&buffer).unwrap();
    assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<Vertex, u8>(&vertices));
}

#[test]
fn empty_upload_is_rejected() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let uploader = ResourceUploader::new(ctx);
    let err = uploader
        .upload("empty", vk::BufferUsageFlags::VERTEX_BUFFER, &[])
        .err()
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<RenderError>(),
        Some(RenderError::ResourceCreation { .. })
    ));
}

#[test]
fn engine_keeps_uploaded_geometry() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let scene = DrawSet::debug_scene();
    let engine = Engine::new(ctx, &scene, &config).unwrap();

    let indices = engine.download_indices(Primitive::Lines).unwrap().unwrap();
    assert_eq!(indices.as_slice(), bytemuck::cast_slice::<u32, u8>(&scene.lines));
    assert_eq!(engine.draw_count(), 3);
}

#[test]
fn empty_model_renders_background_only() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let scene = DrawSet {
        vertices: DrawSet::quad().vertices,
        ..Default::default()
    };
    let mut engine = Engine::new(ctx, &scene, &config).unwrap();
    assert_eq!(engine.draw_count(), 0);
    assert!(engine.download_indices(Primitive::Triangles).unwrap().is_none());

    let frame = engine.capture().unwrap();
    assert_eq!(frame.width(), 64);
    assert_eq!(frame.height(), 48);
    assert!(frame.row_pitch() >= 64 * 4);
    assert!(all_pixels(&frame).iter().all(|&px| px == BACKGROUND));
}

#[test]
fn quad_covers_center_and_leaves_corners_clear() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let mut engine = Engine::new(ctx, &DrawSet::quad(), &config).unwrap();
    let frame = engine.capture().unwrap();

    let center = frame.pixel(32, 24).unwrap();
    assert_ne!(center, BACKGROUND, "center should be covered by the quad");
    assert_eq!(center[3], 255);

    assert_eq!(frame.pixel(0, 0).unwrap(), BACKGROUND);
    assert_eq!(frame.pixel(63, 47).unwrap(), BACKGROUND);

    let row = frame.row(24).unwrap();
    assert_eq!(row.len(), 64 * 4);
    assert!(frame.row(48).is_none());
}

#[test]
fn translated_quad_leaves_the_view() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let mut engine = Engine::new(ctx, &DrawSet::quad(), &config).unwrap();
    engine.transform_handle().apply(&TransformDelta {
        translate_x: 100.0,
        ..Default::default()
    });

    let frame = engine.capture().unwrap();
    assert!(all_pixels(&frame).iter().all(|&px| px == BACKGROUND));
}

#[test]
fn repeated_captures_are_identical() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let mut engine = Engine::new(ctx, &DrawSet::debug_scene(), &config).unwrap();
    let first = engine.capture().unwrap().to_packed().unwrap();
    let second = engine.capture().unwrap().to_packed().unwrap();
    assert_eq!(first, second);
}

#[test]
fn tick_respects_capture_rate() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let mut engine = Engine::new(ctx, &DrawSet::quad(), &config).unwrap();
    let start = Instant::now();

    assert!(engine.tick(start).unwrap().is_some());
    assert!(engine.tick(start + Duration::from_millis(5)).unwrap().is_none());
    assert!(engine.tick(start + Duration::from_millis(10)).unwrap().is_none());
    assert!(engine.tick(start + Duration::from_millis(17)).unwrap().is_some());
}

#[test]
fn invalid_draw_set_is_rejected_before_gpu_work() {
    let config = test_config();
    let Some(ctx) = gpu_context(&config) else { return };

    let mut scene = DrawSet::quad();
    scene.triangles.push(7);

    let err = Engine::new(ctx, &scene, &config).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<RenderError>(),
        Some(RenderError::InvalidDrawSet(_))
    ));
}

#[derive(Clone, Default)]
struct CountingSink {
    frames: Arc<AtomicU64>,
    closed: Arc<Mutex<Option<CloseReason>>>,
}

impl FrameSink for CountingSink {
    fn deliver(&mut self, frame: &MappedFrame) -> anyhow::Result<()> {
        assert_eq!(frame.to_packed()?.len(), 64 * 48 * 4);
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        *self.closed.lock() = Some(reason);
    }
}

#[test]
fn session_delivers_frames_until_stopped() {
    let config = test_config();
    if gpu_context(&config).is_none() {
        return;
    }
    let adapter = Adapter::new(&config.device).unwrap();

    let host = SessionHost::new(adapter, config, DrawSet::debug_scene()).unwrap();
    let sink = CountingSink::default();
    let session = host.open(sink.clone()).unwrap();

    session.apply(&TransformDelta {
        rotate_z: 0.3,
        ..Default::default()
    });
    std::thread::sleep(Duration::from_millis(300));

    let delivered = session.stop_and_join().unwrap();
    assert!(delivered >= 1);
    assert_eq!(delivered, sink.frames.load(Ordering::Relaxed));
    assert_eq!(*sink.closed.lock(), Some(CloseReason::Finished));
}

#[test]
fn failing_session_closes_sink_with_error() {
    let mut config = test_config();
    if gpu_context(&config).is_none() {
        return;
    }
    let adapter = Adapter::new(&config.device).unwrap();
    config.shaders.vertex = "does/not/exist.spv".into();

    let host = SessionHost::new(adapter, config, DrawSet::quad()).unwrap();
    let sink = CountingSink::default();
    let session = host.open(sink.clone()).unwrap();

    let delivered = session.stop_and_join().unwrap();
    assert_eq!(delivered, 0);
    let closed = sink.closed.lock().clone();
    match closed {
        Some(CloseReason::Failed(message)) => assert!(message.contains("shader")),
        other => panic!("unexpected close reason: {:?}", other),
    }
}

#[derive(Clone, Default)]
struct PanickingSink {
    closed: Arc<Mutex<Option<CloseReason>>>,
}

impl FrameSink for PanickingSink {
    fn deliver(&mut self, _frame: &MappedFrame) -> anyhow::Result<()> {
        panic!("sink rejected frame");
    }

    fn close(&mut self, reason: CloseReason) {
        *self.closed.lock() = Some(reason);
    }
}

#[test]
fn panicking_sink_still_gets_closed() {
    let config = test_config();
    if gpu_context(&config).is_none() {
        return;
    }
    let adapter = Adapter::new(&config.device).unwrap();

    let host = SessionHost::new(adapter, config, DrawSet::quad()).unwrap();
    let sink = PanickingSink::default();
    let session = host.open(sink.clone()).unwrap();

    // The first frame is always due, so the worker ends on its own
    let started = Instant::now();
    while !session.is_finished() && started.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(session.is_finished());

    let delivered = session.stop_and_join().unwrap();
    assert_eq!(delivered, 0);
    let closed = sink.closed.lock().clone();
    match closed {
        Some(CloseReason::Failed(message)) => assert!(message.contains("sink rejected frame")),
        other => panic!("unexpected close reason: {:?}", other),
    }
}
