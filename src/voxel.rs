pub mod drawer;
pub mod greedy_meshing;
pub mod grid;
pub mod meshing;

pub use drawer::VoxelDrawer;
pub use grid::VoxelGrid;

use crate::ecs::Entity;

/// Per-entity view of a voxel grid: which grid to draw and which cameras
/// want it considered this frame. The bit index of `cull_mask` identifies
/// the camera slot in per-camera output buffers.
#[derive(Clone, Copy, Debug)]
pub struct VoxelView {
    pub grid: Entity,
    pub cull_mask: u32,
}

pub const MAX_ACTIVE_CAMERAS: usize = 8;

/// Soft cap on how many vertices one frame may regenerate, so an
/// invalidation storm degrades over several frames instead of stalling one.
pub const VOXEL_VERTEX_THRESHOLD: usize = 8 * 1024;
