// =============================================================================
// SCENE CONTENT - Built-in cube mesh, material block and per-draw constants
// =============================================================================

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::{offset_of, size_of};

use crate::backend::pipeline::VertexInput;

/// Interleaved vertex: position + normal + color (36 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub fn input() -> VertexInput {
        let attribute = |location, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset as u32,
        };

        VertexInput {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: size_of::<Vertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: vec![
                attribute(0, offset_of!(Vertex, position)),
                attribute(1, offset_of!(Vertex, normal)),
                attribute(2, offset_of!(Vertex, color)),
            ],
        }
    }
}

/// Model/view/projection for one draw (128 bytes, vertex stage)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PushConstants {
    pub mvp: Mat4,
    pub model: Mat4,
}

impl PushConstants {
    /// Spinning cube seen from slightly above
    pub fn for_frame(frame_counter: u64, aspect: f32) -> Self {
        let angle = frame_counter as f32 * 0.01;
        let model = Mat4::from_rotation_y(angle) * Mat4::from_rotation_x(angle * 0.5);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.5, 3.0), Vec3::ZERO, Vec3::Y);

        let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        Self {
            mvp: projection * view * model,
            model,
        }
    }
}

/// Fragment-stage material block, std140 layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialParameters {
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    /// rgb = specular color, a = shininess
    pub specular_and_shininess: [f32; 4],
}

impl Default for MaterialParameters {
    fn default() -> Self {
        Self {
            ambient: [0.1, 0.1, 0.1, 1.0],
            diffuse: [0.8, 0.8, 0.8, 1.0],
            specular_and_shininess: [0.5, 0.5, 0.5, 32.0],
        }
    }
}

/// Unit cube, four vertices per face so each face has a flat normal
pub fn cube() -> (Vec<Vertex>, Vec<u16>) {
    // (normal, tangent u, tangent v, color)
    let faces: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.9, 0.3, 0.3]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.3]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.3, 0.3, 0.9]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.9, 0.9, 0.3]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.3, 0.9, 0.9]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.9, 0.3, 0.9]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, u, v, color) in faces {
        let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
        let base = vertices.len() as u16;

        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = (n + u * su + v * sv) * 0.5;
            vertices.push(Vertex {
                position: position.into(),
                normal,
                color,
            });
        }

        // Counter-clockwise seen from outside
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_fill_the_vertex_range() {
        assert_eq!(size_of::<PushConstants>(), 128);
        let constants = PushConstants::for_frame(0, 1.0);
        assert_eq!(bytemuck::bytes_of(&constants).len(), 128);
    }

    #[test]
    fn material_block_matches_std140() {
        assert_eq!(size_of::<MaterialParameters>(), 48);
        assert_eq!(offset_of!(MaterialParameters, diffuse), 16);
        assert_eq!(offset_of!(MaterialParameters, specular_and_shininess), 32);
    }

    #[test]
    fn vertex_layout_matches_pipeline_input() {
        let input = Vertex::input();
        assert_eq!(input.bindings[0].stride, 36);
        let offsets: Vec<u32> = input.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn cube_has_flat_faces() {
        let (vertices, indices) = cube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));

        for vertex in &vertices {
            let position = Vec3::from(vertex.position);
            let normal = Vec3::from(vertex.normal);
            // Every corner sits on the face plane its normal points out of
            assert!((position.dot(normal) - 0.5).abs() < 1e-6);
            assert!(position.abs().max_element() <= 0.5 + 1e-6);
        }
    }

    #[test]
    fn faces_wind_counter_clockwise_from_outside() {
        let (vertices, indices) = cube();
        for tri in indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(vertices[i as usize].position));
            let facing = (b - a).cross(c - a);
            let normal = Vec3::from(vertices[tri[0] as usize].normal);
            assert!(facing.dot(normal) > 0.0);
        }
    }
}
