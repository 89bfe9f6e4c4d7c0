// Synchronization primitives
//
// The render loop keeps at most one frame in flight, so a single fence is
// all the CPU needs to know when the GPU is done with the previous frame.
// No semaphores: nothing else consumes the rendered image on the GPU.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::VkResultExt;

/// Fence signaled when the most recent frame submission completes
pub struct FrameFence {
    fence: vk::Fence,
    ctx: Arc<DeviceContext>,
}

impl FrameFence {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self> {
        // Start signaled so the first wait returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { ctx.device.create_fence(&fence_info, None) }.creating("frame fence")?;

        Ok(Self {
            fence,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled. No timeout.
    pub fn wait(&self) -> Result<()> {
        unsafe { self.ctx.device.wait_for_fences(&[self.fence], true, u64::MAX) }
            .transferring("waiting for frame fence")?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.ctx.device.reset_fences(&[self.fence]) }
            .transferring("resetting frame fence")?;
        Ok(())
    }
}

impl Drop for FrameFence {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_fence(self.fence, None) };
    }
}
