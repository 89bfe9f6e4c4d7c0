// GPU -> host pixel readback
//
// The color attachment is optimally tiled and device-local, so the host
// cannot read it directly. Each capture copies it into a fresh linear,
// host-visible image and hands that image to the caller as a MappedFrame.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::{Attachment, DeviceContext};
use crate::error::{RenderError, VkResultExt};

/// Bytes per pixel of the RGBA8 color format
pub const BYTES_PER_PIXEL: usize = 4;

/// Copy `height` rows of `width` pixels out of a pitched buffer into a
/// tightly packed one
pub fn pack_rows(
    bytes: &[u8],
    offset: usize,
    row_pitch: usize,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    if row_pitch < row_bytes {
        anyhow::bail!("row pitch {} is smaller than a row of {} bytes", row_pitch, row_bytes);
    }

    let mut packed = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = offset + y * row_pitch;
        let row = bytes
            .get(start..start + row_bytes)
            .with_context(|| format!("row {} is outside the mapped image", y))?;
        packed.extend_from_slice(row);
    }
    Ok(packed)
}

/// One captured frame in host-visible memory.
///
/// Row `y` starts at `offset() + y * row_pitch()`; each row holds `width`
/// RGBA pixels followed by driver padding.
pub struct MappedFrame {
    image: vk::Image,
    allocation: Option<Allocation>,
    layout: vk::SubresourceLayout,
    width: u32,
    height: u32,
    ctx: Arc<DeviceContext>,
}

impl MappedFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_pitch(&self) -> usize {
        self.layout.row_pitch as usize
    }

    /// Offset of the first row from `as_ptr()`
    pub fn offset(&self) -> usize {
        self.layout.offset as usize
    }

    /// Start of the mapped image memory
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes().as_ptr()
    }

    /// The whole mapped range, padding included
    pub fn bytes(&self) -> &[u8] {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .unwrap_or(&[])
    }

    /// Pixels of row `y`, exactly `width * 4` bytes
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = self.offset() + y as usize * self.row_pitch();
        self.bytes().get(start..start + self.width as usize * BYTES_PER_PIXEL)
    }

    /// RGBA value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let start = x as usize * BYTES_PER_PIXEL;
        row.get(start..start + BYTES_PER_PIXEL)
            .and_then(|px| px.try_into().ok())
    }

    /// Copy with the row padding removed
    pub fn to_packed(&self) -> Result<Vec<u8>> {
        pack_rows(self.bytes(), self.offset(), self.row_pitch(), self.width, self.height)
    }
}

impl Drop for MappedFrame {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().free(allocation) {
                log::warn!("Failed to free readback memory: {}", e);
            }
        }
    }
}

/// Copy the color attachment into a new host-visible frame.
///
/// The attachment must be in TRANSFER_SRC_OPTIMAL with all rendering
/// finished (the render pass leaves it there; callers wait on the frame
/// fence first). Blocks until the copy completes.
pub fn capture(
    ctx: &Arc<DeviceContext>,
    color: &Attachment,
    extent: vk::Extent2D,
) -> Result<MappedFrame> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(color.format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { ctx.device.create_image(&image_info, None) }.creating("readback image")?;

    let mut frame = MappedFrame {
        image,
        allocation: None,
        layout: vk::SubresourceLayout::default(),
        width: extent.width,
        height: extent.height,
        ctx: ctx.clone(),
    };

    let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
    let allocation = ctx
        .allocator()
        .allocate(&AllocationCreateDesc {
            name: "readback image",
            requirements,
            location: MemoryLocation::GpuToCpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| RenderError::creation("readback image", e))?;

    let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
    frame.allocation = Some(allocation);

    unsafe { ctx.device.bind_image_memory(image, memory, offset) }.creating("readback image")?;

    let source = color.image;
    let color_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
        .build();

    ctx.submit_once(ctx.graphics_queue(), "reading back frame", |device, cmd| {
        // Destination: UNDEFINED -> TRANSFER_DST_OPTIMAL
        let to_transfer_dst = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range)
            .build();

        let layers = vk::ImageSubresourceLayers::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1)
            .build();

        let region = vk::ImageCopy::builder()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();

        // Destination: TRANSFER_DST_OPTIMAL -> GENERAL, visible to host reads
        let to_general = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range)
            .build();

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer_dst],
            );
            device.cmd_copy_image(
                cmd,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_general],
            );
        }
        Ok(())
    })?;

    let subresource = vk::ImageSubresource {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        array_layer: 0,
    };
    frame.layout = unsafe { ctx.device.get_image_subresource_layout(image, subresource) };

    if frame.bytes().is_empty() {
        return Err(RenderError::creation("readback image", "memory is not host-mapped").into());
    }

    log::trace!(
        "Captured {}x{} frame (row pitch {}, offset {})",
        frame.width,
        frame.height,
        frame.row_pitch(),
        frame.offset()
    );
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_dropped_when_packing() {
        // 2x2 image, 12-byte pitch (4 bytes of padding per row), 4-byte offset
        let mut bytes = vec![0xEE; 4];
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 0xAA, 0xAA, 0xAA, 0xAA]);
        bytes.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 0xAA, 0xAA, 0xAA, 0xAA]);

        let packed = pack_rows(&bytes, 4, 12, 2, 2).unwrap();
        assert_eq!(packed, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn tight_pitch_is_a_plain_copy() {
        let bytes: Vec<u8> = (0..32).collect();
        assert_eq!(pack_rows(&bytes, 0, 8, 2, 4).unwrap(), bytes);
    }

    #[test]
    fn short_mapping_is_an_error() {
        let bytes = vec![0u8; 10];
        assert!(pack_rows(&bytes, 0, 8, 2, 2).is_err());
    }

    #[test]
    fn pitch_smaller_than_row_is_an_error() {
        let bytes = vec![0u8; 64];
        assert!(pack_rows(&bytes, 0, 4, 2, 2).is_err());
    }
}
