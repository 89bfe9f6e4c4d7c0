// Command recording
//
// The frame never changes shape after construction (same buffers, same
// pipelines, same extent), so its command buffer is recorded once and
// resubmitted every tick. Only the uniform contents change between frames.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use crate::backend::{AttachmentSet, DeviceContext, GpuBuffer, RenderPipeline};
use crate::scene::Primitive;

/// One indexed draw of a primitive set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub primitive: Primitive,
    pub index_count: u32,
    pub instance_count: u32,
}

/// Draws for the given index counts (in `Primitive::ALL` order), skipping
/// empty sets
pub fn plan_draws(counts: [u32; 3]) -> Vec<DrawCall> {
    Primitive::ALL
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .map(|(&primitive, index_count)| DrawCall {
            primitive,
            index_count,
            instance_count: 1,
        })
        .collect()
}

/// Geometry buffers the frame reads from
pub struct FrameInputs<'a> {
    pub vertices: Option<&'a GpuBuffer>,
    /// Indexed by `Primitive::index()`; `None` for empty sets
    pub indices: [Option<&'a GpuBuffer>; 3],
    pub index_counts: [u32; 3],
}

/// Command buffer reused for every frame; freed on drop
pub struct RecordedFrame {
    pub command_buffer: vk::CommandBuffer,
    pub draws: Vec<DrawCall>,
    ctx: Arc<DeviceContext>,
}

impl Drop for RecordedFrame {
    fn drop(&mut self) {
        self.ctx
            .graphics_queue()
            .free(&self.ctx.device, self.command_buffer);
    }
}

pub struct FrameRecorder;

impl FrameRecorder {
    /// Record the render pass and every non-empty draw
    pub fn record(
        ctx: &Arc<DeviceContext>,
        pipeline: &RenderPipeline,
        attachments: &AttachmentSet,
        inputs: &FrameInputs<'_>,
    ) -> Result<RecordedFrame> {
        let draws = plan_draws(inputs.index_counts);
        let extent = attachments.extent;

        let command_buffer = ctx.graphics_queue().allocate_and_record(&ctx.device, |device, cmd| {
            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: [0.0, 0.0, 0.0, 1.0],
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];

            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(pipeline.render_pass)
                .framebuffer(pipeline.framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };

            unsafe {
                device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
                device.cmd_set_viewport(cmd, 0, &[viewport]);
                device.cmd_set_scissor(cmd, 0, &[render_area]);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[pipeline.descriptor_set],
                    &[],
                );

                if let Some(vertices) = inputs.vertices {
                    device.cmd_bind_vertex_buffers(cmd, 0, &[vertices.buffer], &[0]);

                    for draw in &draws {
                        let Some(indices) = inputs.indices[draw.primitive.index()] else {
                            continue;
                        };
                        device.cmd_bind_pipeline(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.pipeline(draw.primitive),
                        );
                        device.cmd_bind_index_buffer(
                            cmd,
                            indices.buffer,
                            0,
                            vk::IndexType::UINT32,
                        );
                        device.cmd_draw_indexed(
                            cmd,
                            draw.index_count,
                            draw.instance_count,
                            0,
                            0,
                            0,
                        );
                    }
                }

                device.cmd_end_render_pass(cmd);
            }
            Ok(())
        })?;

        log::debug!("Recorded frame with {} draw calls", draws.len());
        Ok(RecordedFrame {
            command_buffer,
            draws,
            ctx: ctx.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangles_only_gives_one_draw() {
        let draws = plan_draws([36, 0, 0]);
        assert_eq!(
            draws,
            vec![DrawCall {
                primitive: Primitive::Triangles,
                index_count: 36,
                instance_count: 1,
            }]
        );
    }

    #[test]
    fn draws_follow_fixed_order() {
        let draws = plan_draws([6, 2, 1]);
        let order: Vec<_> = draws.iter().map(|d| d.primitive).collect();
        assert_eq!(order, vec![Primitive::Triangles, Primitive::Lines, Primitive::Points]);
        assert_eq!(draws[1].index_count, 2);
    }

    #[test]
    fn empty_sets_are_not_drawn() {
        assert!(plan_draws([0, 0, 0]).is_empty());

        let draws = plan_draws([0, 4, 0]);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].primitive, Primitive::Lines);
    }
}
