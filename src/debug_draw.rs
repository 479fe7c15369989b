use crate::math::Obb;
use crate::renderer::device::Dev;
use crate::renderer::memory::{self, VideoMemory};
use crate::renderer::pipeline::{bind_graphics, GraphicsPipeline};
use crate::renderer::vertex::VoxelVertex;
use anyhow::Result;
use ash::vk;
use nalgebra::Vector3;

/// Line-list overlay for axes, bounding boxes and whatever else needs
/// eyeballing. Vertices go straight into a host-visible ring that resets
/// every frame.
pub struct DebugDrawer {
    memory: VideoMemory,
    vertex_buffer: vk::Buffer,
    vertices: *mut VoxelVertex,
    max_vertices: usize,
    vertex_offset: usize,
}

/// Box edges as corner-index pairs in the canonical OBB corner order.
const OBB_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (0, 2),
    (0, 4),
    (1, 3),
    (1, 5),
    (2, 3),
    (2, 6),
    (3, 7),
    (4, 5),
    (4, 6),
    (5, 7),
    (6, 7),
];

impl DebugDrawer {
    pub fn new(dev: &Dev, max_vertices: usize) -> Result<DebugDrawer> {
        let vertex_buffer = memory::create_buffer(
            dev,
            (max_vertices * std::mem::size_of::<VoxelVertex>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "debug-draw-buffer",
        )?;
        let requirements = unsafe { dev.get_buffer_memory_requirements(vertex_buffer) };
        let mut memory = VideoMemory::allocate(
            dev,
            requirements.size,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            requirements.memory_type_bits,
            "debug-draw-memory",
        )
        .map_err(|err| anyhow::anyhow!("failed to allocate debug drawer memory: {err}"))?;
        let vertices = memory.bind_buffer(dev, vertex_buffer, &requirements)? as *mut VoxelVertex;
        Ok(DebugDrawer {
            memory,
            vertex_buffer,
            vertices,
            max_vertices,
            vertex_offset: 0,
        })
    }

    pub fn new_frame(&mut self) {
        self.vertex_offset = 0;
    }

    pub fn add_line(&mut self, start: Vector3<f32>, end: Vector3<f32>, color: u32) {
        if self.vertex_offset + 2 > self.max_vertices {
            return;
        }
        unsafe {
            self.vertices.add(self.vertex_offset).write(VoxelVertex {
                position: start,
                color,
            });
            self.vertices.add(self.vertex_offset + 1).write(VoxelVertex {
                position: end,
                color,
            });
        }
        self.vertex_offset += 2;
    }

    pub fn draw_obb(&mut self, obb: &Obb, color: u32) {
        for (a, b) in OBB_EDGES {
            self.add_line(obb.corners[a], obb.corners[b], color);
        }
    }

    pub fn render(
        &self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        sets: &[vk::DescriptorSet],
    ) {
        if self.vertex_offset == 0 {
            return;
        }
        bind_graphics(dev, cmd, pipeline, sets);
        unsafe {
            dev.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer], &[0]);
            dev.cmd_draw(cmd, self.vertex_offset as u32, 1, 0, 0);
        }
    }

    pub fn destroy(&mut self, dev: &Dev) {
        unsafe { dev.destroy_buffer(self.vertex_buffer, None) };
        self.memory.free(dev);
    }
}
