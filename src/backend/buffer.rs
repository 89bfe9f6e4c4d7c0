// Buffer utilities for vertex, index, and uniform buffers
//
// Device-local buffers are filled through a host-visible staging buffer and a
// one-shot copy on the transfer queue. Every buffer owns its allocation and
// releases it on drop.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RenderError, VkResultExt};

/// A buffer and the memory bound to it
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    ctx: Arc<DeviceContext>,
}

impl GpuBuffer {
    /// Create a buffer with memory from `location`.
    ///
    /// `families` lists the queue families that will access the buffer; more
    /// than one selects concurrent sharing.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        families: &[u32],
    ) -> Result<Self> {
        let mut buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if families.len() > 1 {
            buffer_info = buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families);
        }

        let buffer = unsafe { ctx.device.create_buffer(&buffer_info, None) }.creating(name)?;

        // From here on, drop releases whatever has been created
        let mut wrapped = Self {
            buffer,
            size,
            allocation: None,
            ctx: ctx.clone(),
        };

        let requirements = unsafe { ctx.device.get_buffer_memory_requirements(buffer) };

        let allocation = ctx
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::creation(name, e))?;

        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        wrapped.allocation = Some(allocation);

        unsafe { ctx.device.bind_buffer_memory(buffer, memory, offset) }.creating(name)?;

        Ok(wrapped)
    }

    /// Copy `data` to the start of a host-visible buffer
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            anyhow::bail!("write of {} bytes exceeds buffer size {}", bytes.len(), self.size);
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host-visible")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Contents of a host-visible buffer
    pub fn read(&self) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer is not host-visible")?;
        Ok(mapped[..self.size as usize].to_vec())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Creates buffers and moves host data into device-local memory
pub struct ResourceUploader {
    ctx: Arc<DeviceContext>,
}

impl ResourceUploader {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    /// Upload `bytes` into a new device-local buffer.
    ///
    /// Blocks until the copy has finished. The destination also gets
    /// TRANSFER_SRC so it can be read back with `download`.
    pub fn upload(
        &self,
        name: &'static str,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
    ) -> Result<GpuBuffer> {
        if bytes.is_empty() {
            return Err(RenderError::creation(name, "zero-sized buffers are not allowed").into());
        }
        let size = bytes.len() as vk::DeviceSize;

        // Step 1: Host-visible staging buffer holding the data
        let mut staging = GpuBuffer::new(
            &self.ctx,
            "staging buffer",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &[],
        )?;
        staging.write(bytes)?;

        // Step 2: Device-local destination, shared with the graphics queue
        let destination = GpuBuffer::new(
            &self.ctx,
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::GpuOnly,
            &self.ctx.buffer_families(),
        )?;

        // Step 3: Copy and wait; staging is released when it goes out of scope
        self.copy(&staging, &destination, size, "uploading buffer data")?;

        log::debug!("Uploaded {} bytes into {}", size, name);
        Ok(destination)
    }

    /// Upload a slice of plain-old-data values
    pub fn upload_slice<T: Pod>(
        &self,
        name: &'static str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<GpuBuffer> {
        self.upload(name, usage, bytemuck::cast_slice(data))
    }

    /// Persistently mapped buffer the host writes directly (uniforms)
    pub fn create_host_visible(
        &self,
        name: &'static str,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(&self.ctx, name, size, usage, MemoryLocation::CpuToGpu, &[])
    }

    /// Copy a device-local buffer back to the host
    pub fn download(&self, source: &GpuBuffer) -> Result<Vec<u8>> {
        let readback = GpuBuffer::new(
            &self.ctx,
            "download buffer",
            source.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            &[],
        )?;

        self.copy(source, &readback, source.size, "downloading buffer data")?;
        readback.read()
    }

    fn copy(
        &self,
        source: &GpuBuffer,
        destination: &GpuBuffer,
        size: vk::DeviceSize,
        stage: &'static str,
    ) -> Result<()> {
        let (src, dst) = (source.buffer, destination.buffer);
        self.ctx.submit_once(self.ctx.transfer_queue(), stage, |device, cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }
}
