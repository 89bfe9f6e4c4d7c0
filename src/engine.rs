// Engine: one off-screen render instance
//
// FRAME FLOW (Engine::tick):
// 1. Wait for the previous submission (frame fence)
// 2. Write the current transform into the uniform buffer
// 3. Reset the fence and resubmit the pre-recorded command buffer
// 4. If a capture is due, wait again and copy the pixels back to the host
//
// Field order is the reverse of creation order, so the implicit drops after
// `Drop::drop` release everything the way it was built, backwards.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{
    AttachmentSet, DeviceContext, FrameFence, GpuBuffer, RenderPipeline, ResourceUploader,
};
use crate::config::{CameraConfig, Config};
use crate::readback::{self, MappedFrame};
use crate::recorder::{FrameInputs, FrameRecorder, RecordedFrame};
use crate::scene::{DrawSet, Primitive};
use crate::scheduler::FrameScheduler;
use crate::transform::{Transform, TransformHandle, UniformFrame};

pub struct Engine {
    frame: RecordedFrame,
    fence: FrameFence,
    _pipeline: RenderPipeline,
    index_buffers: [Option<GpuBuffer>; 3],
    vertex_buffer: Option<GpuBuffer>,
    uniform: GpuBuffer,
    attachments: AttachmentSet,
    uploader: ResourceUploader,
    scheduler: FrameScheduler,
    transform: TransformHandle,
    camera: CameraConfig,
    /// A submission may still be executing
    in_flight: bool,
    ctx: Arc<DeviceContext>,
}

impl Engine {
    pub fn new(ctx: Arc<DeviceContext>, draw_set: &DrawSet, config: &Config) -> Result<Self> {
        Self::with_transform(ctx, draw_set, config, TransformHandle::default())
    }

    /// Build an engine driven by an existing transform handle
    pub fn with_transform(
        ctx: Arc<DeviceContext>,
        draw_set: &DrawSet,
        config: &Config,
        transform: TransformHandle,
    ) -> Result<Self> {
        // Reject bad input before touching the GPU
        draw_set.validate()?;
        config.validate()?;

        let extent = vk::Extent2D {
            width: config.output.width,
            height: config.output.height,
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Render targets
        // ─────────────────────────────────────────────────────────────────────
        let attachments = AttachmentSet::new(&ctx, extent).context("Failed to create attachments")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Uniform buffer (host-visible, rewritten every frame)
        // ─────────────────────────────────────────────────────────────────────
        let uploader = ResourceUploader::new(ctx.clone());
        let mut uniform = uploader.create_host_visible(
            "uniform buffer",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            std::mem::size_of::<UniformFrame>() as vk::DeviceSize,
        )?;
        let aspect = extent.width as f32 / extent.height as f32;
        let initial = UniformFrame::compose(&transform.snapshot(), &config.camera, aspect, 0.0);
        uniform.write(&[initial])?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Render pass, descriptors and pipelines
        // ─────────────────────────────────────────────────────────────────────
        let pipeline = RenderPipeline::new(&ctx, &attachments, &uniform, &config.shaders)
            .context("Failed to create render pipeline")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Geometry, uploaded once. Empty lists get no buffer.
        // ─────────────────────────────────────────────────────────────────────
        let vertex_buffer = if draw_set.vertices.is_empty() {
            None
        } else {
            Some(uploader.upload_slice(
                "vertex buffer",
                vk::BufferUsageFlags::VERTEX_BUFFER,
                &draw_set.vertices,
            )?)
        };

        let mut index_buffers: [Option<GpuBuffer>; 3] = [None, None, None];
        for primitive in Primitive::ALL {
            let indices = draw_set.indices(primitive);
            if indices.is_empty() {
                continue;
            }
            let name = match primitive {
                Primitive::Triangles => "triangle index buffer",
                Primitive::Lines => "line index buffer",
                Primitive::Points => "point index buffer",
            };
            index_buffers[primitive.index()] =
                Some(uploader.upload_slice(name, vk::BufferUsageFlags::INDEX_BUFFER, indices)?);
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Record the frame once
        // ─────────────────────────────────────────────────────────────────────
        let inputs = FrameInputs {
            vertices: vertex_buffer.as_ref(),
            indices: [
                index_buffers[0].as_ref(),
                index_buffers[1].as_ref(),
                index_buffers[2].as_ref(),
            ],
            index_counts: draw_set.index_counts(),
        };
        let frame = FrameRecorder::record(&ctx, &pipeline, &attachments, &inputs)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Synchronization
        // ─────────────────────────────────────────────────────────────────────
        let fence = FrameFence::new(&ctx)?;
        let scheduler = FrameScheduler::new(
            &config.capture,
            config.camera.spin_degrees_per_second,
            Instant::now(),
        );

        log::info!(
            "Engine ready: {}x{}, {} vertices, {} draw calls, capture every {:?}",
            extent.width,
            extent.height,
            draw_set.vertices.len(),
            frame.draws.len(),
            config.capture.refresh_delay()
        );

        Ok(Self {
            frame,
            fence,
            _pipeline: pipeline,
            index_buffers,
            vertex_buffer,
            uniform,
            attachments,
            uploader,
            scheduler,
            transform,
            camera: config.camera,
            in_flight: false,
            ctx,
        })
    }

    /// Handle for feeding transform updates from another thread
    pub fn transform_handle(&self) -> TransformHandle {
        self.transform.clone()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.attachments.extent
    }

    /// Render one frame; returns the pixels when a capture was due
    pub fn tick(&mut self, now: Instant) -> Result<Option<MappedFrame>> {
        let transform = self.render_frame(now)?;

        if !self.scheduler.should_capture(now, &transform) {
            return Ok(None);
        }

        let frame = self.read_back()?;
        self.scheduler.record_capture(now, transform);
        Ok(Some(frame))
    }

    /// Render and read back immediately, ignoring the capture throttle
    pub fn capture(&mut self) -> Result<MappedFrame> {
        let now = Instant::now();
        let transform = self.render_frame(now)?;
        let frame = self.read_back()?;
        self.scheduler.record_capture(now, transform);
        Ok(frame)
    }

    /// Wait, update the uniform, submit. Returns the transform that was used.
    fn render_frame(&mut self, now: Instant) -> Result<Transform> {
        // Previous frame must be done reading the uniform buffer
        self.wait_for_frame()?;

        let transform = self.transform.snapshot();
        let extent = self.attachments.extent;
        let uniform = UniformFrame::compose(
            &transform,
            &self.camera,
            extent.width as f32 / extent.height as f32,
            self.scheduler.spin_angle(now),
        );
        self.uniform.write(&[uniform])?;

        self.fence.reset()?;
        self.ctx
            .graphics_queue()
            .submit(&self.ctx.device, &[self.frame.command_buffer], self.fence.handle())
            .context("Failed to submit frame")?;
        self.in_flight = true;

        log::trace!("Submitted frame");
        Ok(transform)
    }

    fn wait_for_frame(&mut self) -> Result<()> {
        self.fence.wait()?;
        self.in_flight = false;
        Ok(())
    }

    fn read_back(&mut self) -> Result<MappedFrame> {
        self.wait_for_frame()?;
        readback::capture(&self.ctx, &self.attachments.color, self.attachments.extent)
    }

    /// Copy an uploaded geometry buffer back to the host
    pub fn download_vertices(&self) -> Result<Option<Vec<u8>>> {
        self.vertex_buffer
            .as_ref()
            .map(|buffer| self.uploader.download(buffer))
            .transpose()
    }

    pub fn download_indices(&self, primitive: Primitive) -> Result<Option<Vec<u8>>> {
        self.index_buffers[primitive.index()]
            .as_ref()
            .map(|buffer| self.uploader.download(buffer))
            .transpose()
    }

    /// Number of draw calls in the recorded frame
    pub fn draw_count(&self) -> usize {
        self.frame.draws.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Nothing may be released while the GPU still uses it. Uploads and
        // readbacks are blocking, so the frame submission is all that can be
        // pending. The device may be shared, so no device-wide idle here.
        if self.in_flight {
            if let Err(e) = self.fence.wait() {
                log::warn!("Failed to wait for the last frame: {:#}", e);
            }
        }
        log::debug!("Engine released");
    }
}
