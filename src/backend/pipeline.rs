// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// One pipeline per primitive topology; everything else is shared.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;

use super::attachment::AttachmentSet;
use super::buffer::GpuBuffer;
use super::shader::ShaderModule;
use super::DeviceContext;
use crate::config::ShaderConfig;
use crate::error::{RenderError, VkResultExt};
use crate::scene::{Primitive, Vertex};

/// Render pass, framebuffer, uniform descriptor and the three pipelines
pub struct RenderPipeline {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub layout: vk::PipelineLayout,
    /// Indexed by `Primitive::index()`
    pipelines: [vk::Pipeline; 3],
    ctx: Arc<DeviceContext>,
}

impl RenderPipeline {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        attachments: &AttachmentSet,
        uniform: &GpuBuffer,
        shaders: &ShaderConfig,
    ) -> Result<Self> {
        // Every handle starts null; drop skips whatever was never created
        let mut wrapped = Self {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            layout: vk::PipelineLayout::null(),
            pipelines: [vk::Pipeline::null(); 3],
            ctx: ctx.clone(),
        };

        let device = &ctx.device;
        wrapped.render_pass = create_render_pass(device, attachments)?;
        wrapped.framebuffer = create_framebuffer(device, attachments, wrapped.render_pass)?;
        wrapped.descriptor_set_layout = create_descriptor_set_layout(device)?;
        wrapped.descriptor_pool = create_descriptor_pool(device)?;
        wrapped.descriptor_set = allocate_uniform_set(
            device,
            wrapped.descriptor_pool,
            wrapped.descriptor_set_layout,
            uniform,
        )?;

        let set_layouts = [wrapped.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        wrapped.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .creating("pipeline layout")?;

        wrapped.pipelines = create_graphics_pipelines(
            device,
            wrapped.render_pass,
            wrapped.layout,
            &shaders.vertex,
            &shaders.fragment,
        )?;

        log::info!("Created render pipelines for {:?}", Primitive::ALL);
        Ok(wrapped)
    }

    pub fn pipeline(&self, primitive: Primitive) -> vk::Pipeline {
        self.pipelines[primitive.index()]
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            for &pipeline in self.pipelines.iter().rev() {
                if pipeline != vk::Pipeline::null() {
                    device.destroy_pipeline(pipeline, None);
                }
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            // Destroying the pool frees the set
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            }
            if self.framebuffer != vk::Framebuffer::null() {
                device.destroy_framebuffer(self.framebuffer, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
        }
    }
}

/// Render pass whose color output ends up ready to be copied out
fn create_render_pass(device: &ash::Device, attachments: &AttachmentSet) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(attachments.color.format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(attachments.depth.format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    // Previous frame's readback copy and depth writes must finish before
    // this frame clears the attachments
    let entry = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    // Color writes visible to the readback copy
    let exit = vk::SubpassDependency::builder()
        .src_subpass(0)
        .dst_subpass(vk::SUBPASS_EXTERNAL)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags::TRANSFER)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .build();

    let attachment_descs = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[entry, exit];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachment_descs)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }
        .creating("render pass")?;
    Ok(render_pass)
}

fn create_framebuffer(
    device: &ash::Device,
    attachments: &AttachmentSet,
    render_pass: vk::RenderPass,
) -> Result<vk::Framebuffer> {
    let views = &[attachments.color.view, attachments.depth.view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(views)
        .width(attachments.extent.width)
        .height(attachments.extent.height)
        .layers(1);

    let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None) }
        .creating("framebuffer")?;
    Ok(framebuffer)
}

/// Binding 0: the per-frame matrices, read by the vertex stage
fn create_descriptor_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let bindings = [vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX)
        .build()];

    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
        .creating("descriptor set layout")?;
    Ok(layout)
}

fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool> {
    let pool_sizes = [vk::DescriptorPoolSize::builder()
        .ty(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .build()];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(1);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
        .creating("descriptor pool")?;
    Ok(pool)
}

fn allocate_uniform_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    uniform: &GpuBuffer,
) -> Result<vk::DescriptorSet> {
    let set_layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&set_layouts);
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
        .creating("descriptor set")?[0];

    let buffer_info = [vk::DescriptorBufferInfo::builder()
        .buffer(uniform.buffer)
        .offset(0)
        .range(uniform.size)
        .build()];

    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_info)
        .build();

    unsafe { device.update_descriptor_sets(&[write], &[]) };
    Ok(set)
}

/// Create one pipeline per primitive in a single call
fn create_graphics_pipelines(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    vertex_path: &Path,
    fragment_path: &Path,
) -> Result<[vk::Pipeline; 3]> {
    // Modules are dropped on return, including the error paths
    let vert_shader = ShaderModule::load(device, vertex_path)?;
    let frag_shader = ShaderModule::load(device, fragment_path)?;

    let entry_point = c"main";

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader.module)
        .name(entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader.module)
        .name(entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex input
    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    // Input assembly, the only per-pipeline difference
    let input_assemblies = Primitive::ALL.map(|primitive| {
        vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(primitive.topology())
            .primitive_restart_enable(false)
            .build()
    });

    // Viewport and scissor are set while recording
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization, no culling
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Color blending (no blending, opaque)
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_infos: Vec<_> = input_assemblies
        .iter()
        .map(|input_assembly| {
            vk::GraphicsPipelineCreateInfo::builder()
                .stages(shader_stages)
                .vertex_input_state(&vertex_input_info)
                .input_assembly_state(input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterizer)
                .multisample_state(&multisampling)
                .depth_stencil_state(&depth_stencil)
                .color_blend_state(&color_blending)
                .dynamic_state(&dynamic_state)
                .layout(layout)
                .render_pass(render_pass)
                .subpass(0)
                .build()
        })
        .collect();

    let created = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &pipeline_infos, None)
    };

    let pipelines = match created {
        Ok(pipelines) => pipelines,
        Err((partial, result)) => {
            // Some implementations still return the pipelines that succeeded
            for pipeline in partial.into_iter().filter(|&p| p != vk::Pipeline::null()) {
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
            return Err(RenderError::creation("graphics pipelines", result).into());
        }
    };

    let pipelines: [vk::Pipeline; 3] = pipelines
        .try_into()
        .ok()
        .context("Driver returned an unexpected number of pipelines")?;
    Ok(pipelines)
}
