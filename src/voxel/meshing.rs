use crate::renderer::vertex::VoxelVertex;
use crate::voxel::grid::VoxelGrid;
use nalgebra::Vector3;

/// Fixed face order used everywhere: -X, +X, -Y, +Y, -Z, +Z.
pub const FACE_NORMALS: [[i64; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

pub const FACE_NORMALS_F32: [Vector3<f32>; 6] = [
    Vector3::new(-1., 0., 0.),
    Vector3::new(1., 0., 0.),
    Vector3::new(0., -1., 0.),
    Vector3::new(0., 1., 0.),
    Vector3::new(0., 0., -1.),
    Vector3::new(0., 0., 1.),
];

/// Four unit-cube corners per face. The winding is consistent across faces
/// so face normals are implicit in the draw ordering.
pub const FACE_CORNERS: [[[u32; 3]; 4]; 6] = [
    // -X
    [[0, 1, 1], [0, 1, 0], [0, 0, 0], [0, 0, 1]],
    // +X
    [[1, 1, 0], [1, 1, 1], [1, 0, 1], [1, 0, 0]],
    // -Y
    [[1, 0, 0], [1, 0, 1], [0, 0, 1], [0, 0, 0]],
    // +Y
    [[1, 1, 1], [1, 1, 0], [0, 1, 0], [0, 1, 1]],
    // -Z
    [[1, 1, 0], [1, 0, 0], [0, 0, 0], [0, 1, 0]],
    // +Z
    [[1, 0, 1], [1, 1, 1], [0, 1, 1], [0, 0, 1]],
];

/// Two triangles per quad.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// A mesher turns one axis-aligned face of a grid into an indexed quad
/// stream: 4 vertices and 6 indices per quad, appended to the output
/// buffers. Emitted indices are relative to the grid's first vertex, offset
/// by `base_index` (the vertex count of the faces already meshed for this
/// grid). Returns the number of vertices appended.
pub trait Mesher {
    fn mesh_face(
        grid: &VoxelGrid,
        face: usize,
        base_index: u32,
        vertices: &mut Vec<VoxelVertex>,
        indices: &mut Vec<u32>,
    ) -> u32;
}

/// One quad per exposed voxel face. Not used on the hot path, kept for
/// diagnostic comparison against the greedy mesher.
pub struct NaiveMesher;

impl Mesher for NaiveMesher {
    fn mesh_face(
        grid: &VoxelGrid,
        face: usize,
        base_index: u32,
        vertices: &mut Vec<VoxelVertex>,
        indices: &mut Vec<u32>,
    ) -> u32 {
        let first_vertex = vertices.len();
        let (half_size, inv_size) = grid.size();
        let normal = FACE_NORMALS[face];
        for z in 0..grid.depth {
            for y in 0..grid.height {
                for x in 0..grid.width {
                    let voxel = grid.get(x, y, z);
                    if voxel == 0 {
                        continue;
                    }
                    let near = grid.get_checked(
                        x as i64 + normal[0],
                        y as i64 + normal[1],
                        z as i64 + normal[2],
                    );
                    if near != 0 {
                        continue;
                    }
                    let quad_base = base_index + (vertices.len() - first_vertex) as u32;
                    for index in QUAD_INDICES {
                        indices.push(quad_base + index);
                    }
                    for corner in FACE_CORNERS[face] {
                        vertices.push(VoxelVertex {
                            position: Vector3::new(
                                (x + corner[0]) as f32 * inv_size - half_size.x,
                                (y + corner[1]) as f32 * inv_size - half_size.y,
                                (z + corner[2]) as f32 * inv_size - half_size.z,
                            ),
                            color: grid.palette[voxel as usize],
                        });
                    }
                }
            }
        }
        (vertices.len() - first_vertex) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_all<M: Mesher>(grid: &VoxelGrid) -> (Vec<VoxelVertex>, Vec<u32>, [u32; 6]) {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut offsets = [0; 6];
        let mut base_index = 0;
        for face in 0..6 {
            offsets[face] = M::mesh_face(grid, face, base_index, &mut vertices, &mut indices);
            base_index += offsets[face];
        }
        (vertices, indices, offsets)
    }

    #[test]
    fn all_air_produces_no_vertices() {
        let grid = VoxelGrid::new(4, 4, 4);
        let (vertices, indices, _) = mesh_all::<NaiveMesher>(&grid);
        assert!(vertices.is_empty());
        assert!(indices.is_empty());
    }

    #[test]
    fn single_voxel_emits_six_quads() {
        let mut grid = VoxelGrid::new(3, 3, 3);
        grid.set(1, 1, 1, 3);
        let (vertices, indices, offsets) = mesh_all::<NaiveMesher>(&grid);
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert_eq!(offsets, [4; 6]);
        // Index ranges of consecutive faces do not overlap.
        for face in 0..6 {
            let range = &indices[face * 6..face * 6 + 6];
            assert!(range.iter().all(|&i| i >= face as u32 * 4));
            assert!(range.iter().all(|&i| i < face as u32 * 4 + 4));
        }
    }

    #[test]
    fn interior_faces_are_hidden() {
        let mut grid = VoxelGrid::new(2, 1, 1);
        grid.set(0, 0, 0, 1);
        grid.set(1, 0, 0, 1);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        // +X of the left voxel is covered by the right voxel.
        let count = NaiveMesher::mesh_face(&grid, 1, 0, &mut vertices, &mut indices);
        assert_eq!(count, 4);
        assert!(vertices.iter().all(|v| v.position.x == 0.5));
    }
}
