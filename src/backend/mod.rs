// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Every GPU object is owned by a guard that releases it on drop.

pub mod attachment;
pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod sync;

pub use attachment::{Attachment, AttachmentSet};
pub use buffer::{GpuBuffer, ResourceUploader};
pub use device::{Adapter, CommandQueue, DeviceContext};
pub use pipeline::RenderPipeline;
pub use sync::FrameFence;
