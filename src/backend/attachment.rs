// Off-screen render targets
//
// One color image the frame is rendered into and read back from, plus a
// depth image in the best depth format the GPU supports.

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RenderError, VkResultExt};

/// Color format of the rendered frame (RGBA, no sRGB encoding)
pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate whose features for `tiling` include `features`
pub fn find_supported_format<F>(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    query: F,
) -> Option<vk::Format>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    candidates.iter().copied().find(|&format| {
        let props = query(format);
        let supported = match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features,
            _ => props.optimal_tiling_features,
        };
        supported.contains(features)
    })
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Aspect used for views and barriers of a depth format
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Select the depth format for the attachment set
pub fn select_depth_format<F>(query: F) -> Result<vk::Format, RenderError>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        query,
    )
    .ok_or_else(|| RenderError::UnsupportedFormat {
        purpose: "depth attachment",
        candidates: DEPTH_FORMAT_CANDIDATES.to_vec(),
    })
}

/// Readback copies the color image into a linear image of the same format
pub fn check_readback_support<F>(format: vk::Format, query: F) -> Result<(), RenderError>
where
    F: Fn(vk::Format) -> vk::FormatProperties,
{
    find_supported_format(
        &[format],
        vk::ImageTiling::LINEAR,
        vk::FormatFeatureFlags::TRANSFER_DST,
        query,
    )
    .map(|_| ())
    .ok_or_else(|| RenderError::UnsupportedFormat {
        purpose: "linear readback",
        candidates: vec![format],
    })
}

/// An image, its memory and a view covering the whole image
pub struct Attachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    allocation: Option<Allocation>,
    ctx: Arc<DeviceContext>,
}

impl Attachment {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        name: &'static str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { ctx.device.create_image(&image_info, None) }.creating(name)?;

        let mut wrapped = Self {
            image,
            view: vk::ImageView::null(),
            format,
            aspect,
            allocation: None,
            ctx: ctx.clone(),
        };

        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };
        let allocation = ctx
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::creation(name, e))?;

        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        wrapped.allocation = Some(allocation);

        unsafe { ctx.device.bind_image_memory(image, memory, offset) }.creating(name)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            );

        wrapped.view = unsafe { ctx.device.create_image_view(&view_info, None) }.creating(name)?;

        Ok(wrapped)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.ctx.device.destroy_image_view(self.view, None);
            }
            self.ctx.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.ctx.allocator().free(allocation) {
                log::warn!("Failed to free attachment memory: {}", e);
            }
        }
    }
}

/// Color and depth targets of one engine
pub struct AttachmentSet {
    pub color: Attachment,
    pub depth: Attachment,
    pub extent: vk::Extent2D,
}

impl AttachmentSet {
    pub fn new(ctx: &Arc<DeviceContext>, extent: vk::Extent2D) -> Result<Self> {
        let adapter = ctx.adapter();
        let query = |format: vk::Format| adapter.format_properties(format);

        check_readback_support(COLOR_FORMAT, query)?;
        let depth_format = select_depth_format(query)?;
        log::debug!("Using depth format {:?}", depth_format);

        let color = Attachment::new(
            ctx,
            "color attachment",
            extent,
            COLOR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
        )?;

        let depth = Attachment::new(
            ctx,
            "depth attachment",
            extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(depth_format),
        )?;

        log::info!(
            "Created {}x{} attachments ({:?} + {:?})",
            extent.width,
            extent.height,
            COLOR_FORMAT,
            depth_format
        );

        Ok(Self {
            color,
            depth,
            extent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimal(features: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: features,
            ..Default::default()
        }
    }

    #[test]
    fn first_supported_depth_format_wins() {
        let format = select_depth_format(|format| match format {
            vk::Format::D32_SFLOAT | vk::Format::D16_UNORM => {
                optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            }
            _ => vk::FormatProperties::default(),
        })
        .unwrap();
        assert_eq!(format, vk::Format::D32_SFLOAT);
        assert_eq!(depth_aspect(format), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn stencil_formats_get_stencil_aspect() {
        let format =
            select_depth_format(|_| optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
                .unwrap();
        assert_eq!(format, vk::Format::D32_SFLOAT_S8_UINT);
        assert!(depth_aspect(format).contains(vk::ImageAspectFlags::STENCIL));
    }

    #[test]
    fn no_depth_format_is_reported() {
        let err = select_depth_format(|_| vk::FormatProperties::default()).unwrap_err();
        match err {
            RenderError::UnsupportedFormat { purpose, candidates } => {
                assert_eq!(purpose, "depth attachment");
                assert_eq!(candidates.len(), DEPTH_FORMAT_CANDIDATES.len());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn readback_needs_linear_transfer_dst() {
        // Optimal support alone is not enough
        let only_optimal = |_| optimal(vk::FormatFeatureFlags::TRANSFER_DST);
        assert!(check_readback_support(COLOR_FORMAT, only_optimal).is_err());

        let linear = |_| vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::TRANSFER_DST,
            ..Default::default()
        };
        assert!(check_readback_support(COLOR_FORMAT, linear).is_ok());
    }
}
