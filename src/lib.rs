// =============================================================================
// OFFSCREEN STREAM - Headless Vulkan renderer with host readback
// =============================================================================
//
// Renders a small point/line/triangle scene into an off-screen color target
// and copies the pixels back to host memory at a throttled rate, for a
// streaming layer to encode and send.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  SessionHost (one render thread per client)                     │
// │    └── Engine (one off-screen instance)                         │
// │          ├── AttachmentSet + RenderPipeline                     │
// │          ├── Geometry buffers (ResourceUploader)                │
// │          ├── RecordedFrame (command buffer, recorded once)      │
// │          └── FrameScheduler -> Readback -> MappedFrame          │
// │    └── DeviceContext (logical device, queues, allocator)        │
// │          └── Adapter (instance + physical device)               │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod readback;
pub mod recorder;
pub mod scene;
pub mod scheduler;
pub mod session;
pub mod transform;

pub use backend::{Adapter, DeviceContext, GpuBuffer, ResourceUploader};
pub use config::{CapturePolicy, Config};
pub use engine::Engine;
pub use error::RenderError;
pub use readback::MappedFrame;
pub use scene::{DrawSet, Primitive, Vertex};
pub use session::{CloseReason, FrameSink, SessionHandle, SessionHost};
pub use transform::{Transform, TransformDelta, TransformHandle, UniformFrame};
