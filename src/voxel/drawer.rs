use crate::camera::{Camera, CameraKind};
use crate::ecs::{ComponentTable, Entity};
use crate::math::{Obb, Transform};
use crate::renderer::deletion_queue::{DeletedObject, DeletionQueue};
use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::memory::{self, VideoMemory};
use crate::renderer::pipeline::{bind_compute, bind_graphics, ComputePipeline, GraphicsPipeline};
use crate::renderer::shader::BindingDesc;
use crate::renderer::util::execution_barrier;
use crate::renderer::vertex::VoxelVertex;
use crate::voxel::greedy_meshing::GreedyMesher;
use crate::voxel::grid::VoxelGrid;
use crate::voxel::meshing::{Mesher, FACE_NORMALS_F32};
use crate::voxel::{VoxelView, MAX_ACTIVE_CAMERAS, VOXEL_VERTEX_THRESHOLD};
use anyhow::Result;
use ash::vk;
use log::{debug, info, trace};
use nalgebra::{Matrix4, Vector3};

/// Per-instance record consumed by the culling compute shader. 48 bytes,
/// must match Draw_Data in shaders/culling.glsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawData {
    half_size: [f32; 3],
    first_vertex: u32,
    first_instance: u32,
    vertex_count: [u32; 6],
    cull_mask: u32,
}

/// CPU-side draw list entry of the direct backend, one per face.
#[derive(Clone, Copy, Debug)]
struct DrawCommand {
    vertex_count: u32,
    first_vertex: u32,
    first_instance: u32,
}

/// Stride of VkDrawIndexedIndirectCommand slots in the indirect buffer,
/// padded to 32 for std140-friendly indexing in the shader.
const INDIRECT_STRIDE: u32 = 32;

/// Stride of one per-camera draw counter, again padded for std140.
const COUNT_STRIDE: u32 = 16;

/// OBB corners of each face, in the canonical corner order of `Obb`.
const FACE_OBB_CORNERS: [[usize; 4]; 6] = [
    [0, 1, 2, 3],
    [4, 5, 6, 7],
    [0, 1, 4, 5],
    [2, 3, 6, 7],
    [0, 2, 4, 6],
    [1, 3, 5, 7],
];

/// Caches voxel meshes in one large vertex buffer keyed by grid content
/// hash, streams per-instance transforms through a double-buffered ring,
/// and submits draws through one of two backends: direct (CPU-culled
/// indexed draws) or indirect (GPU-culled vkCmdDrawIndexedIndirect).
pub struct VoxelDrawer {
    cpu_memory: VideoMemory,
    gpu_memory: VideoMemory,
    max_vertices: usize,
    max_draws: usize,
    num_draws: usize,
    backend: Backend,
    scratch_vertices: Vec<VoxelVertex>,
    scratch_indices: Vec<u32>,
}

enum Backend {
    Direct(DirectBackend),
    Indirect(IndirectBackend),
}

struct DirectBackend {
    vertex_buffer: vk::Buffer,
    transform_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    vertices: *mut VoxelVertex,
    transforms: *mut Transform,
    indices: *mut u32,
    vertex_offset: usize,
    transform_offset: usize,
    start_transform_offset: usize,
    draws: Vec<DrawCommand>,
    meshes: Vec<Entity>,
    num_vertices: usize,
}

struct IndirectBackend {
    vertex_buffer: vk::Buffer,
    transform_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    storage_buffer: vk::Buffer,
    indirect_buffer: vk::Buffer,
    count_buffer: vk::Buffer,
    ds_set: vk::DescriptorSet,
    vertices: *mut VoxelVertex,
    transforms: *mut Transform,
    indices: *mut u32,
    draw_data: *mut DrawData,
    vertex_offset: usize,
    transform_offset: usize,
    start_transform_offset: usize,
    draw_offset: usize,
    start_draw_offset: usize,
    num_vertices: usize,
    use_draw_count: bool,
}

/// Compute pipelines for one frame's cull passes, selected by the renderer
/// for the indirect-count capability of the device.
pub struct CullPipelines<'a> {
    pub ortho: &'a ComputePipeline,
    pub persp: &'a ComputePipeline,
    pub pyramid_read_set: vk::DescriptorSet,
}

pub struct VoxelPipelines<'a> {
    pub colored: &'a GraphicsPipeline,
    pub shadow: &'a GraphicsPipeline,
}

#[repr(C)]
struct CullPushConstants {
    projview: Matrix4<f32>,
    camera_front: Vector3<f32>,
    cull_mask: u32,
    camera_position: Vector3<f32>,
    pass_id: u32,
    out_offset: u32,
    in_offset: u32,
    num_draws: u32,
}

impl VoxelDrawer {
    pub fn new(
        dev: &Dev,
        caches: &mut crate::renderer::caches::Caches,
        pools: &DescriptorPools,
        max_vertices: usize,
        max_draws: usize,
    ) -> Result<VoxelDrawer> {
        let mut drawer = VoxelDrawer {
            cpu_memory: VideoMemory::null(),
            gpu_memory: VideoMemory::null(),
            max_vertices,
            max_draws,
            num_draws: 0,
            backend: Backend::Direct(DirectBackend::empty()),
            scratch_vertices: Vec::new(),
            scratch_indices: Vec::new(),
        };
        if dev.support.multi_draw_indirect {
            drawer.backend = Backend::Indirect(IndirectBackend::create(
                dev,
                caches,
                pools,
                &mut drawer.cpu_memory,
                &mut drawer.gpu_memory,
                max_vertices,
                max_draws,
            )?);
            info!("indirect voxel drawing backend set");
        } else {
            drawer.backend = Backend::Direct(DirectBackend::create(
                dev,
                &mut drawer.cpu_memory,
                max_vertices,
                max_draws,
            )?);
            info!("direct voxel drawing backend set");
        }
        Ok(drawer)
    }

    /// Begins a frame. The transform ring is split in two slots: even
    /// frames reset it, odd frames continue past the previous frame's
    /// watermark so the in-flight frame's transforms stay live.
    pub fn new_frame(&mut self, frame: u64) {
        self.num_draws = 0;
        match &mut self.backend {
            Backend::Direct(backend) => {
                if frame & 1 == 0 {
                    backend.transform_offset = 0;
                }
                backend.start_transform_offset = backend.transform_offset;
                backend.draws.clear();
                backend.meshes.clear();
                backend.num_vertices = 0;
            }
            Backend::Indirect(backend) => {
                if frame & 1 == 0 {
                    backend.transform_offset = 0;
                    backend.draw_offset = 0;
                }
                backend.start_transform_offset = backend.transform_offset;
                backend.start_draw_offset = backend.draw_offset;
                backend.num_vertices = 0;
            }
        }
    }

    /// Resets the vertex watermark and invalidates every cached mesh, so
    /// every grid regenerates on its next push.
    pub fn clear_cache(&mut self, grids: &mut ComponentTable<VoxelGrid>) {
        for (_, grid) in grids.iter_mut() {
            grid.first_vertex = u32::MAX;
        }
        match &mut self.backend {
            Backend::Direct(backend) => backend.vertex_offset = 0,
            Backend::Indirect(backend) => backend.vertex_offset = 0,
        }
    }

    pub fn num_draws(&self) -> usize {
        self.num_draws
    }

    pub fn push_mesh(
        &mut self,
        entity: Entity,
        view: &VoxelView,
        grid: &mut VoxelGrid,
        transform: &Transform,
    ) {
        if self.num_draws >= self.max_draws {
            trace!("draw list full, dropping instance");
            return;
        }
        match &mut self.backend {
            Backend::Direct(backend) => {
                if backend.transform_offset >= 2 * self.max_draws {
                    trace!("transform ring full, dropping instance");
                    return;
                }
                let regenerated = maybe_regenerate(
                    grid,
                    backend.vertex_offset,
                    backend.num_vertices,
                    self.max_vertices,
                    &mut self.scratch_vertices,
                    &mut self.scratch_indices,
                );
                if let Some((vertices, indices)) = regenerated {
                    backend.upload(vertices, indices);
                }
                backend.push(entity, grid, transform);
            }
            Backend::Indirect(backend) => {
                if backend.transform_offset >= 2 * self.max_draws {
                    trace!("transform ring full, dropping instance");
                    return;
                }
                let regenerated = maybe_regenerate(
                    grid,
                    backend.vertex_offset,
                    backend.num_vertices,
                    self.max_vertices,
                    &mut self.scratch_vertices,
                    &mut self.scratch_indices,
                );
                if let Some((vertices, indices)) = regenerated {
                    backend.upload(vertices, indices);
                }
                backend.push(view, grid, transform);
            }
        }
        self.num_draws += 1;
    }

    /// Per-camera GPU culling. A no-op on the direct backend, whose culling
    /// happens on the CPU while submitting draws.
    pub fn cull(
        &mut self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        cameras: &[&Camera],
        pipelines: &CullPipelines,
    ) {
        let num_draws = self.num_draws;
        match &mut self.backend {
            Backend::Direct(_) => {}
            Backend::Indirect(backend) => {
                backend.cull(dev, cmd, cameras, pipelines, num_draws);
            }
        }
    }

    /// Binds the pipeline matching the camera kind (perspective cameras get
    /// the lit pipeline, orthographic ones the depth-only shadow pipeline)
    /// and issues this frame's draws. Returns the number of draw calls.
    pub fn render(
        &mut self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        camera: &Camera,
        pipelines: &VoxelPipelines,
        sets: &[vk::DescriptorSet],
        views: &ComponentTable<VoxelView>,
        transforms: &ComponentTable<Transform>,
        obbs: &ComponentTable<Obb>,
    ) -> u32 {
        let num_draws = self.num_draws;
        match &mut self.backend {
            Backend::Direct(backend) => {
                backend.render(dev, cmd, camera, pipelines, sets, views, transforms, obbs)
            }
            Backend::Indirect(backend) => {
                backend.render(dev, cmd, camera, pipelines, sets, num_draws)
            }
        }
    }

    pub fn stats(&self) -> String {
        match &self.backend {
            Backend::Direct(backend) => format!(
                "[vertices: {}] [draws: {}]",
                backend.vertex_offset,
                backend.meshes.len()
            ),
            Backend::Indirect(backend) => format!(
                "[vertices: {}] [draws: {}]",
                backend.vertex_offset,
                backend.draw_offset - backend.start_draw_offset
            ),
        }
    }

    pub fn destroy(&mut self, dev: &Dev, deletion_queue: Option<(&mut DeletionQueue, u64)>) {
        let buffers: Vec<vk::Buffer> = match &self.backend {
            Backend::Direct(backend) => vec![
                backend.index_buffer,
                backend.transform_buffer,
                backend.vertex_buffer,
            ],
            Backend::Indirect(backend) => vec![
                backend.count_buffer,
                backend.indirect_buffer,
                backend.storage_buffer,
                backend.index_buffer,
                backend.transform_buffer,
                backend.vertex_buffer,
            ],
        };
        match deletion_queue {
            Some((queue, frame)) => {
                for buffer in buffers {
                    queue.push(DeletedObject::Buffer(buffer), frame);
                }
            }
            None => {
                for buffer in buffers {
                    unsafe { dev.destroy_buffer(buffer, None) };
                }
                self.cpu_memory.free(dev);
                self.gpu_memory.free(dev);
            }
        }
    }
}

/// Runs the greedy mesher for all six faces when the grid's cache entry is
/// stale, honouring the per-frame regeneration threshold. Returns the
/// streams to upload, or None when the cache can be reused (or nothing can
/// be done this frame).
fn maybe_regenerate<'a>(
    grid: &mut VoxelGrid,
    vertex_offset: usize,
    num_vertices: usize,
    max_vertices: usize,
    scratch_vertices: &'a mut Vec<VoxelVertex>,
    scratch_indices: &'a mut Vec<u32>,
) -> Option<(&'a [VoxelVertex], &'a [u32])> {
    let stale = grid.hash != grid.last_hash || grid.first_vertex as usize > vertex_offset;
    if !stale {
        return None;
    }
    if num_vertices >= VOXEL_VERTEX_THRESHOLD {
        // Over the per-frame meshing budget. An invalidation storm degrades
        // over several frames instead of stalling this one; a still-valid
        // stale region keeps getting drawn until its turn comes.
        return None;
    }
    scratch_vertices.clear();
    scratch_indices.clear();
    let mut offsets = [0u32; 6];
    let mut base_index = 0;
    for face in 0..6 {
        offsets[face] =
            GreedyMesher::mesh_face(grid, face, base_index, scratch_vertices, scratch_indices);
        base_index += offsets[face];
    }
    let total = scratch_vertices.len();
    debug_assert!(total as u32 <= 3 * grid.width * grid.height * grid.depth);
    if vertex_offset + total > max_vertices {
        debug!("vertex buffer full, grid mesh dropped this frame");
        return None;
    }
    grid.last_hash = grid.hash;
    grid.first_vertex = vertex_offset as u32;
    grid.offsets = offsets;
    Some((scratch_vertices, scratch_indices))
}

impl DirectBackend {
    fn empty() -> DirectBackend {
        DirectBackend {
            vertex_buffer: vk::Buffer::null(),
            transform_buffer: vk::Buffer::null(),
            index_buffer: vk::Buffer::null(),
            vertices: std::ptr::null_mut(),
            transforms: std::ptr::null_mut(),
            indices: std::ptr::null_mut(),
            vertex_offset: 0,
            transform_offset: 0,
            start_transform_offset: 0,
            draws: Vec::new(),
            meshes: Vec::new(),
            num_vertices: 0,
        }
    }

    fn create(
        dev: &Dev,
        cpu_memory: &mut VideoMemory,
        max_vertices: usize,
        max_draws: usize,
    ) -> Result<DirectBackend> {
        let mut backend = DirectBackend::empty();
        backend.vertex_buffer = memory::create_buffer(
            dev,
            (max_vertices * std::mem::size_of::<VoxelVertex>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "voxel-drawer/vertex-buffer",
        )?;
        backend.transform_buffer = memory::create_buffer(
            dev,
            (2 * max_draws * std::mem::size_of::<Transform>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "voxel-drawer/transform-buffer",
        )?;
        backend.index_buffer = memory::create_buffer(
            dev,
            (max_vertices * 3 / 2 * std::mem::size_of::<u32>()) as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "voxel-drawer/index-buffer",
        )?;
        let requirements = [
            unsafe { dev.get_buffer_memory_requirements(backend.vertex_buffer) },
            unsafe { dev.get_buffer_memory_requirements(backend.transform_buffer) },
            unsafe { dev.get_buffer_memory_requirements(backend.index_buffer) },
        ];
        *cpu_memory = allocate_host_visible(dev, &requirements, "voxel-drawer/memory")?;
        backend.vertices =
            cpu_memory.bind_buffer(dev, backend.vertex_buffer, &requirements[0])? as *mut _;
        backend.transforms =
            cpu_memory.bind_buffer(dev, backend.transform_buffer, &requirements[1])? as *mut _;
        backend.indices =
            cpu_memory.bind_buffer(dev, backend.index_buffer, &requirements[2])? as *mut _;
        Ok(backend)
    }

    /// Copies freshly meshed streams into the mapped buffers and advances
    /// the vertex watermark past them.
    fn upload(&mut self, vertices: &[VoxelVertex], indices: &[u32]) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                vertices.as_ptr(),
                self.vertices.add(self.vertex_offset),
                vertices.len(),
            );
            std::ptr::copy_nonoverlapping(
                indices.as_ptr(),
                self.indices.add(self.vertex_offset * 3 / 2),
                indices.len(),
            );
        }
        self.vertex_offset += vertices.len();
        self.num_vertices += vertices.len();
    }

    fn push(&mut self, entity: Entity, grid: &VoxelGrid, transform: &Transform) {
        unsafe {
            self.transforms.add(self.transform_offset).write(*transform);
        }
        let first_instance = (self.transform_offset - self.start_transform_offset) as u32;
        // A cache entry is usable only while its whole range sits below the
        // watermark; a grid whose regeneration was deferred past a cache
        // clear draws nothing this frame.
        let cache_valid = cached_range_valid(grid, self.vertex_offset);
        let mut first_vertex = if cache_valid { grid.first_vertex } else { 0 };
        for face in 0..6 {
            let vertex_count = if cache_valid { grid.offsets[face] } else { 0 };
            self.draws.push(DrawCommand {
                vertex_count,
                first_vertex,
                first_instance,
            });
            first_vertex += vertex_count;
        }
        self.transform_offset += 1;
        self.meshes.push(entity);
    }

    #[allow(clippy::too_many_arguments)]
    fn render(
        &mut self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        camera: &Camera,
        pipelines: &VoxelPipelines,
        sets: &[vk::DescriptorSet],
        views: &ComponentTable<VoxelView>,
        transforms: &ComponentTable<Transform>,
        obbs: &ComponentTable<Obb>,
    ) -> u32 {
        let pipeline = match camera.kind {
            CameraKind::Persp => pipelines.colored,
            CameraKind::Ortho => pipelines.shadow,
        };
        let buffers = [self.vertex_buffer, self.transform_buffer];
        let offsets = [
            0,
            (self.start_transform_offset * std::mem::size_of::<Transform>()) as u64,
        ];
        unsafe {
            dev.cmd_bind_vertex_buffers(cmd, 0, &buffers, &offsets);
            dev.cmd_bind_index_buffer(cmd, self.index_buffer, 0, vk::IndexType::UINT32);
        }
        bind_graphics(dev, cmd, pipeline, sets);

        let mut draw_calls = 0;
        for (i, &entity) in self.meshes.iter().enumerate() {
            let Some(view) = views.get(entity) else {
                continue;
            };
            if view.cull_mask & camera.cull_mask == 0 {
                continue;
            }
            let (Some(transform), Some(obb)) = (transforms.get(entity), obbs.get(entity)) else {
                continue;
            };
            let mut merged = [DrawCommand {
                vertex_count: 0,
                first_vertex: 0,
                first_instance: 0,
            }; 3];
            let mut merged_count = 0;
            let mut last_written_vertex = u32::MAX;
            for face in 0..6 {
                let command = self.draws[i * 6 + face];
                if command.vertex_count == 0 {
                    continue;
                }
                if !face_visible(camera, obb, transform, face) {
                    continue;
                }
                if last_written_vertex == command.first_vertex {
                    merged[merged_count - 1].vertex_count += command.vertex_count;
                    last_written_vertex += command.vertex_count;
                } else {
                    if merged_count == merged.len() {
                        break;
                    }
                    merged[merged_count] = command;
                    merged_count += 1;
                    last_written_vertex = command.first_vertex + command.vertex_count;
                }
            }
            let vertex_offset = self.draws[i * 6].first_vertex;
            for command in &merged[..merged_count] {
                unsafe {
                    dev.cmd_draw_indexed(
                        cmd,
                        command.vertex_count * 3 / 2,
                        1,
                        command.first_vertex * 3 / 2,
                        vertex_offset as i32,
                        command.first_instance,
                    )
                };
                draw_calls += 1;
            }
        }
        draw_calls
    }
}

/// The cached range [first_vertex, first_vertex + sum(offsets)) must lie
/// entirely below the vertex watermark to be drawable.
fn cached_range_valid(grid: &VoxelGrid, vertex_offset: usize) -> bool {
    grid.first_vertex != u32::MAX
        && grid.first_vertex as usize + grid.offsets.iter().sum::<u32>() as usize <= vertex_offset
}

fn face_center(obb: &Obb, face: usize) -> Vector3<f32> {
    let corners = FACE_OBB_CORNERS[face];
    (obb.corners[corners[0]]
        + obb.corners[corners[1]]
        + obb.corners[corners[2]]
        + obb.corners[corners[3]])
        * 0.25
}

/// Strict backface test, identical to the one the culling shader applies: a
/// face is drawn only when its rotated normal opposes the view direction.
/// Grazing faces (dot == 0) project to nothing; excluding them keeps at
/// most one face of each axis pair alive, so at most three faces per
/// instance survive and the three-command-per-instance output bound holds
/// on both backends.
fn face_visible(camera: &Camera, obb: &Obb, transform: &Transform, face: usize) -> bool {
    let view_dir = match camera.kind {
        CameraKind::Persp => face_center(obb, face) - camera.position,
        CameraKind::Ortho => camera.front,
    };
    let normal = transform.rotation * FACE_NORMALS_F32[face];
    view_dir.dot(&normal) < 0.
}

impl IndirectBackend {
    #[allow(clippy::too_many_arguments)]
    fn create(
        dev: &Dev,
        caches: &mut crate::renderer::caches::Caches,
        pools: &DescriptorPools,
        cpu_memory: &mut VideoMemory,
        gpu_memory: &mut VideoMemory,
        max_vertices: usize,
        max_draws: usize,
    ) -> Result<IndirectBackend> {
        let use_draw_count = dev.support.draw_indirect_count;
        let vertex_buffer = memory::create_buffer(
            dev,
            (max_vertices * std::mem::size_of::<VoxelVertex>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "voxel-drawer/vertex-buffer",
        )?;
        let transform_buffer = memory::create_buffer(
            dev,
            (2 * max_draws * std::mem::size_of::<Transform>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            "voxel-drawer/transform-buffer",
        )?;
        let index_buffer = memory::create_buffer(
            dev,
            (max_vertices * 3 / 2 * std::mem::size_of::<u32>()) as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "voxel-drawer/index-buffer",
        )?;
        let storage_buffer = memory::create_buffer(
            dev,
            (2 * max_draws * std::mem::size_of::<DrawData>()) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "voxel-drawer/storage-buffer",
        )?;
        let indirect_buffer = memory::create_buffer(
            dev,
            (MAX_ACTIVE_CAMERAS * 3 * max_draws * INDIRECT_STRIDE as usize) as u64,
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            "voxel-drawer/indirect-buffer",
        )?;
        let count_buffer = memory::create_buffer(
            dev,
            (MAX_ACTIVE_CAMERAS * COUNT_STRIDE as usize) as u64,
            vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            "voxel-drawer/count-buffer",
        )?;

        let cpu_requirements = [
            unsafe { dev.get_buffer_memory_requirements(vertex_buffer) },
            unsafe { dev.get_buffer_memory_requirements(transform_buffer) },
            unsafe { dev.get_buffer_memory_requirements(index_buffer) },
            unsafe { dev.get_buffer_memory_requirements(storage_buffer) },
        ];
        *cpu_memory = allocate_host_visible(dev, &cpu_requirements, "voxel-drawer/memory")?;
        let gpu_requirements = [
            unsafe { dev.get_buffer_memory_requirements(indirect_buffer) },
            unsafe { dev.get_buffer_memory_requirements(count_buffer) },
        ];
        let gpu_merged = memory::merge_requirements(&gpu_requirements);
        *gpu_memory = VideoMemory::allocate(
            dev,
            gpu_merged.size,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            gpu_merged.memory_type_bits,
            "voxel-drawer/fast-memory",
        )
        .map_err(|err| anyhow::anyhow!("failed to allocate indirect memory: {err}"))?;

        let mut backend = IndirectBackend {
            vertex_buffer,
            transform_buffer,
            index_buffer,
            storage_buffer,
            indirect_buffer,
            count_buffer,
            ds_set: vk::DescriptorSet::null(),
            vertices: std::ptr::null_mut(),
            transforms: std::ptr::null_mut(),
            indices: std::ptr::null_mut(),
            draw_data: std::ptr::null_mut(),
            vertex_offset: 0,
            transform_offset: 0,
            start_transform_offset: 0,
            draw_offset: 0,
            start_draw_offset: 0,
            num_vertices: 0,
            use_draw_count,
        };
        backend.vertices =
            cpu_memory.bind_buffer(dev, vertex_buffer, &cpu_requirements[0])? as *mut _;
        backend.transforms =
            cpu_memory.bind_buffer(dev, transform_buffer, &cpu_requirements[1])? as *mut _;
        backend.indices =
            cpu_memory.bind_buffer(dev, index_buffer, &cpu_requirements[2])? as *mut _;
        backend.draw_data =
            cpu_memory.bind_buffer(dev, storage_buffer, &cpu_requirements[3])? as *mut _;
        gpu_memory.bind_buffer(dev, indirect_buffer, &gpu_requirements[0])?;
        gpu_memory.bind_buffer(dev, count_buffer, &gpu_requirements[1])?;

        // The culling shader's descriptor interface; the count buffer
        // binding exists only on the indirect-count variants.
        let binding_count = if use_draw_count { 4 } else { 3 };
        let bindings: Vec<BindingDesc> = (0..binding_count)
            .map(|binding| BindingDesc {
                binding,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            })
            .collect();
        backend.ds_set =
            crate::renderer::caches::allocate_descriptor_sets(dev, caches, pools, &bindings, 1, false)
                .map_err(|err| anyhow::anyhow!("failed to allocate cull set: {err}"))?[0];
        let buffers = [storage_buffer, transform_buffer, indirect_buffer, count_buffer];
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|buffer| {
                vk::DescriptorBufferInfo::default()
                    .buffer(*buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = (0..binding_count as usize)
            .map(|binding| {
                vk::WriteDescriptorSet::default()
                    .dst_set(backend.ds_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_infos[binding]))
            })
            .collect();
        unsafe { dev.update_descriptor_sets(&writes, &[]) };
        Ok(backend)
    }

    fn upload(&mut self, vertices: &[VoxelVertex], indices: &[u32]) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                vertices.as_ptr(),
                self.vertices.add(self.vertex_offset),
                vertices.len(),
            );
            std::ptr::copy_nonoverlapping(
                indices.as_ptr(),
                self.indices.add(self.vertex_offset * 3 / 2),
                indices.len(),
            );
        }
        self.vertex_offset += vertices.len();
        self.num_vertices += vertices.len();
    }

    fn push(&mut self, view: &VoxelView, grid: &VoxelGrid, transform: &Transform) {
        unsafe {
            self.transforms.add(self.transform_offset).write(*transform);
        }
        let cache_valid = cached_range_valid(grid, self.vertex_offset);
        let (half_size, _) = grid.size();
        let draw = DrawData {
            half_size: [half_size.x, half_size.y, half_size.z],
            first_vertex: if cache_valid { grid.first_vertex } else { 0 },
            first_instance: (self.transform_offset - self.start_transform_offset) as u32,
            vertex_count: if cache_valid { grid.offsets } else { [0; 6] },
            cull_mask: if cache_valid { view.cull_mask } else { 0 },
        };
        unsafe { self.draw_data.add(self.draw_offset).write(draw) };
        self.draw_offset += 1;
        self.transform_offset += 1;
    }

    fn cull(
        &mut self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        cameras: &[&Camera],
        pipelines: &CullPipelines,
        num_draws: usize,
    ) {
        if num_draws == 0 {
            return;
        }
        debug_assert!(cameras.len() <= MAX_ACTIVE_CAMERAS);
        if self.use_draw_count {
            unsafe {
                dev.cmd_fill_buffer(cmd, self.count_buffer, 0, vk::WHOLE_SIZE, 0);
            }
            execution_barrier(
                dev,
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            );
        }
        let mut last_kind = None;
        for camera in cameras.iter() {
            let pipeline = match camera.kind {
                CameraKind::Persp => pipelines.persp,
                CameraKind::Ortho => pipelines.ortho,
            };
            if last_kind != Some(camera.kind) {
                match camera.kind {
                    CameraKind::Persp => {
                        let sets = [self.ds_set, pipelines.pyramid_read_set];
                        bind_compute(dev, cmd, pipeline, &sets);
                    }
                    CameraKind::Ortho => {
                        bind_compute(dev, cmd, pipeline, &[self.ds_set]);
                    }
                }
                last_kind = Some(camera.kind);
            }
            let slot = camera.cull_mask.trailing_zeros();
            let push_constants = CullPushConstants {
                projview: camera.projview(),
                camera_front: camera.front,
                cull_mask: camera.cull_mask,
                camera_position: camera.position,
                pass_id: slot,
                out_offset: slot * num_draws as u32,
                in_offset: self.start_draw_offset as u32,
                num_draws: num_draws as u32,
            };
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (&push_constants as *const CullPushConstants) as *const u8,
                    std::mem::size_of::<CullPushConstants>(),
                )
            };
            unsafe {
                dev.cmd_push_constants(
                    cmd,
                    pipeline.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytes,
                );
                dev.cmd_dispatch(cmd, (num_draws as u32).div_ceil(64), 1, 1);
            }
        }
        // The rasterisation passes consume the commands written here.
        execution_barrier(
            dev,
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::DRAW_INDIRECT,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn render(
        &mut self,
        dev: &Dev,
        cmd: vk::CommandBuffer,
        camera: &Camera,
        pipelines: &VoxelPipelines,
        sets: &[vk::DescriptorSet],
        num_draws: usize,
    ) -> u32 {
        if num_draws == 0 {
            return 0;
        }
        let pipeline = match camera.kind {
            CameraKind::Persp => pipelines.colored,
            CameraKind::Ortho => pipelines.shadow,
        };
        let buffers = [self.vertex_buffer, self.transform_buffer];
        let offsets = [
            0,
            (self.start_transform_offset * std::mem::size_of::<Transform>()) as u64,
        ];
        unsafe {
            dev.cmd_bind_vertex_buffers(cmd, 0, &buffers, &offsets);
            dev.cmd_bind_index_buffer(cmd, self.index_buffer, 0, vk::IndexType::UINT32);
        }
        bind_graphics(dev, cmd, pipeline, sets);

        let slot = camera.cull_mask.trailing_zeros();
        let max_draw_calls = num_draws as u32 * 3;
        let offset = (slot * max_draw_calls * INDIRECT_STRIDE) as u64;
        if self.use_draw_count {
            let count_offset = (slot * COUNT_STRIDE) as u64;
            unsafe {
                dev.draw_indirect_count_ext
                    .as_ref()
                    .unwrap()
                    .cmd_draw_indexed_indirect_count(
                        cmd,
                        self.indirect_buffer,
                        offset,
                        self.count_buffer,
                        count_offset,
                        max_draw_calls,
                        INDIRECT_STRIDE,
                    )
            };
        } else {
            unsafe {
                dev.cmd_draw_indexed_indirect(
                    cmd,
                    self.indirect_buffer,
                    offset,
                    max_draw_calls,
                    INDIRECT_STRIDE,
                )
            };
        }
        1
    }
}

/// GPU memory reachable from the CPU, preferring the device-local kind when
/// the platform has one.
fn allocate_host_visible(
    dev: &Dev,
    requirements: &[vk::MemoryRequirements],
    label: &str,
) -> Result<VideoMemory> {
    let merged = memory::merge_requirements(requirements);
    let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    let memory = VideoMemory::allocate(
        dev,
        merged.size,
        required | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        merged.memory_type_bits,
        label,
    )
    .or_else(|_| {
        VideoMemory::allocate(dev, merged.size, required, merged.memory_type_bits, label)
    })
    .map_err(|err| anyhow::anyhow!("failed to allocate video memory for voxels: {err}"))?;
    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn visible_faces(camera: &Camera, transform: &Transform) -> Vec<usize> {
        let obb = Obb::from_half_size(Vector3::new(0.5, 0.5, 0.5), transform);
        (0..6)
            .filter(|&face| face_visible(camera, &obb, transform, face))
            .collect()
    }

    #[test]
    fn ortho_axis_aligned_instance_keeps_one_face() {
        // The shadow camera's front hits an unrotated box dead on: four of
        // the six faces graze (dot == 0) and must not survive.
        let camera = Camera::orthographic(1);
        let visible = visible_faces(&camera, &Transform::identity());
        assert_eq!(visible, vec![4]);
    }

    #[test]
    fn at_most_three_faces_survive_any_rotation() {
        let mut ortho = Camera::orthographic(1);
        ortho.front = Vector3::new(0.03, -1.9, 0.09).normalize();
        let mut persp = Camera::perspective(2);
        persp.position = Vector3::new(3., 2., 1.);
        for camera in [&ortho, &persp] {
            for roll in 0..8 {
                for pitch in 0..8 {
                    let transform = Transform {
                        rotation: UnitQuaternion::from_euler_angles(
                            roll as f32 * 0.4,
                            pitch as f32 * 0.4,
                            (roll + pitch) as f32 * 0.2,
                        ),
                        position: Vector3::new(0., 0.5, 0.),
                        scale: 1.,
                    };
                    let visible = visible_faces(camera, &transform);
                    assert!(visible.len() <= 3, "{} faces visible", visible.len());
                    for pair in 0..3 {
                        assert!(
                            !(visible.contains(&(2 * pair)) && visible.contains(&(2 * pair + 1))),
                            "both faces of axis {pair} visible"
                        );
                    }
                }
            }
        }
    }
}
