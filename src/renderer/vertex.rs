use crate::math::Transform;
use ash::vk;
use nalgebra::Vector3;
use std::mem::{offset_of, size_of};

/// 16 bytes: world-offset position and a packed RGBA colour. Both the voxel
/// meshes and the debug line drawer use this layout.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VoxelVertex {
    pub position: Vector3<f32>,
    pub color: u32,
}

pub const VOXEL_VERTEX_BINDINGS: [vk::VertexInputBindingDescription; 2] = [
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<VoxelVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    },
    vk::VertexInputBindingDescription {
        binding: 1,
        stride: size_of::<Transform>() as u32,
        input_rate: vk::VertexInputRate::INSTANCE,
    },
];

/// Vertex layout of the lit voxel pipeline: per-vertex position and colour,
/// per-instance transform.
pub const VOXEL_VERTEX_ATTRIBUTES: [vk::VertexInputAttributeDescription; 5] = [
    vk::VertexInputAttributeDescription {
        location: 0,
        binding: 0,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: offset_of!(VoxelVertex, position) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 1,
        binding: 0,
        format: vk::Format::R32_UINT,
        offset: offset_of!(VoxelVertex, color) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 2,
        binding: 1,
        format: vk::Format::R32G32B32A32_SFLOAT,
        offset: offset_of!(Transform, rotation) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 3,
        binding: 1,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: offset_of!(Transform, position) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 4,
        binding: 1,
        format: vk::Format::R32_SFLOAT,
        offset: offset_of!(Transform, scale) as u32,
    },
];

/// Depth-only variant: no colour attribute.
pub const VOXEL_SHADOW_ATTRIBUTES: [vk::VertexInputAttributeDescription; 4] = [
    vk::VertexInputAttributeDescription {
        location: 0,
        binding: 0,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: offset_of!(VoxelVertex, position) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 1,
        binding: 1,
        format: vk::Format::R32G32B32A32_SFLOAT,
        offset: offset_of!(Transform, rotation) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 2,
        binding: 1,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: offset_of!(Transform, position) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 3,
        binding: 1,
        format: vk::Format::R32_SFLOAT,
        offset: offset_of!(Transform, scale) as u32,
    },
];

pub const LINE_VERTEX_BINDINGS: [vk::VertexInputBindingDescription; 1] =
    [vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<VoxelVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];

pub const LINE_VERTEX_ATTRIBUTES: [vk::VertexInputAttributeDescription; 2] = [
    vk::VertexInputAttributeDescription {
        location: 0,
        binding: 0,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: offset_of!(VoxelVertex, position) as u32,
    },
    vk::VertexInputAttributeDescription {
        location: 1,
        binding: 0,
        format: vk::Format::R32_UINT,
        offset: offset_of!(VoxelVertex, color) as u32,
    },
];

pub fn pack_color(r: u8, g: u8, b: u8, a: u8) -> u32 {
    ((a as u32) << 24) | ((b as u32) << 16) | ((g as u32) << 8) | r as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_struct_sizes() {
        assert_eq!(size_of::<VoxelVertex>(), 16);
        assert_eq!(size_of::<Transform>(), 32);
    }

    #[test]
    fn color_packing_is_little_endian_rgba() {
        assert_eq!(pack_color(0x11, 0x22, 0x33, 0xFF), 0xFF332211);
    }
}
