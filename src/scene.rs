// Scene data: vertices and the three index lists drawn from them
//
// A DrawSet is supplied once, before the engine is built. It is validated up
// front so malformed input never reaches the GPU.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::RenderError;

/// Interleaved vertex as laid out in the vertex buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }

    /// One binding, advanced per vertex
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    /// Position at location 0, color at location 1
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Self, position) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Self, color) as u32)
                .build(),
        ]
    }
}

/// Kind of primitive an index list is assembled into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Triangles,
    Lines,
    Points,
}

impl Primitive {
    /// Draw order used by the recorder
    pub const ALL: [Primitive; 3] = [Primitive::Triangles, Primitive::Lines, Primitive::Points];

    pub fn topology(self) -> vk::PrimitiveTopology {
        match self {
            Primitive::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            Primitive::Lines => vk::PrimitiveTopology::LINE_LIST,
            Primitive::Points => vk::PrimitiveTopology::POINT_LIST,
        }
    }

    /// Indices consumed per primitive
    pub fn arity(self) -> usize {
        match self {
            Primitive::Triangles => 3,
            Primitive::Lines => 2,
            Primitive::Points => 1,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Vertices plus triangle, line and point index lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawSet {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<u32>,
    pub lines: Vec<u32>,
    pub points: Vec<u32>,
}

impl DrawSet {
    pub fn indices(&self, primitive: Primitive) -> &[u32] {
        match primitive {
            Primitive::Triangles => &self.triangles,
            Primitive::Lines => &self.lines,
            Primitive::Points => &self.points,
        }
    }

    /// Index counts in `Primitive::ALL` order
    pub fn index_counts(&self) -> [u32; 3] {
        Primitive::ALL.map(|p| self.indices(p).len() as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.index_counts().iter().all(|&count| count == 0)
    }

    /// Check list lengths and index ranges
    pub fn validate(&self) -> Result<(), RenderError> {
        let vertex_count = self.vertices.len();

        for primitive in Primitive::ALL {
            let indices = self.indices(primitive);

            if indices.len() % primitive.arity() != 0 {
                return Err(RenderError::InvalidDrawSet(format!(
                    "{:?} index count {} is not a multiple of {}",
                    primitive,
                    indices.len(),
                    primitive.arity()
                )));
            }

            if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(RenderError::InvalidDrawSet(format!(
                    "{:?} index {} is out of range for {} vertices",
                    primitive, bad, vertex_count
                )));
            }
        }

        Ok(())
    }

    /// Two quads, a line and a point; used when no model is supplied
    pub fn debug_scene() -> Self {
        Self {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0]),
                Vertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
                Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0]),

                Vertex::new([-0.5, -0.5, -0.5], [1.0, 0.0, 0.0]),
                Vertex::new([0.5, -0.5, -0.5], [0.0, 1.0, 0.0]),
                Vertex::new([0.5, 0.5, -0.5], [0.0, 0.0, 1.0]),
                Vertex::new([-0.5, 0.5, -0.5], [1.0, 1.0, 1.0]),

                Vertex::new([-0.6, -0.6, -0.6], [0.0, 0.0, 1.0]),
                Vertex::new([0.6, 0.6, 0.6], [0.0, 1.0, 0.0]),

                Vertex::new([0.7, 0.7, 0.7], [1.0, 1.0, 1.0]),
            ],
            triangles: vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4],
            lines: vec![8, 9],
            points: vec![10],
        }
    }

    /// Single colored quad in the z = 0 plane
    pub fn quad() -> Self {
        Self {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0]),
                Vertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
                Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0]),
            ],
            triangles: vec![0, 1, 2, 2, 3, 0],
            lines: vec![],
            points: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 24);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[1].location, 1);
    }

    #[test]
    fn debug_scene_is_valid() {
        let scene = DrawSet::debug_scene();
        scene.validate().unwrap();
        assert_eq!(scene.index_counts(), [12, 2, 1]);
    }

    #[test]
    fn triangle_count_must_be_multiple_of_three() {
        let mut scene = DrawSet::quad();
        scene.triangles.push(0);
        let err = scene.validate().unwrap_err();
        assert!(matches!(err, RenderError::InvalidDrawSet(_)));
        assert!(err.to_string().contains("Triangles"));
    }

    #[test]
    fn line_count_must_be_even() {
        let mut scene = DrawSet::quad();
        scene.lines = vec![0, 1, 2];
        assert!(scene.validate().is_err());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut scene = DrawSet::quad();
        scene.points = vec![4];
        let err = scene.validate().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn indices_without_vertices_are_rejected() {
        let scene = DrawSet {
            points: vec![0],
            ..Default::default()
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn empty_model_is_valid() {
        let scene = DrawSet {
            vertices: DrawSet::quad().vertices,
            ..Default::default()
        };
        scene.validate().unwrap();
        assert!(scene.is_empty());
    }

    #[test]
    fn primitives_map_to_topologies_in_draw_order() {
        let topologies: Vec<_> = Primitive::ALL.iter().map(|p| p.topology()).collect();
        assert_eq!(
            topologies,
            vec![
                vk::PrimitiveTopology::TRIANGLE_LIST,
                vk::PrimitiveTopology::LINE_LIST,
                vk::PrimitiveTopology::POINT_LIST,
            ]
        );
    }
}
