use crate::renderer::vertex::VoxelVertex;
use crate::voxel::grid::VoxelGrid;
use crate::voxel::meshing::{Mesher, FACE_CORNERS, FACE_NORMALS, QUAD_INDICES};
use nalgebra::Vector3;

/// Greedy mesher: on every layer along the face's axis, runs of
/// same-coloured voxels whose outward neighbour is air are merged into
/// maximal rectangles. Every cell is visited a bounded number of times
/// thanks to the merged-cell scratch mask, so a full grid meshes in
/// O(width * height * depth).
pub struct GreedyMesher;

impl Mesher for GreedyMesher {
    fn mesh_face(
        grid: &VoxelGrid,
        face: usize,
        base_index: u32,
        vertices: &mut Vec<VoxelVertex>,
        indices: &mut Vec<u32>,
    ) -> u32 {
        let first_vertex = vertices.len();
        let (half_size, inv_size) = grid.size();
        let dims = [grid.width, grid.height, grid.depth];
        let normal = FACE_NORMALS[face];
        let d = face >> 1;
        let u = (d + 1) % 3;
        let v = (d + 2) % 3;

        let mut merged = vec![false; (dims[u] * dims[v]) as usize];
        for layer in 0..dims[d] {
            merged.fill(false);
            for j in 0..dims[v] {
                for i in 0..dims[u] {
                    // Already merged cells are skipped, which is what keeps
                    // the total work linear in the number of cells.
                    if merged[(i + j * dims[u]) as usize] {
                        continue;
                    }
                    let mut pos = [0u32; 3];
                    pos[d] = layer;
                    pos[u] = i;
                    pos[v] = j;
                    let start_voxel = grid.get(pos[0], pos[1], pos[2]);
                    if start_voxel == 0 {
                        continue;
                    }
                    let start_pos = pos;
                    let mut min_i = dims[u];

                    // Grow the rectangle row by row while every voxel in the
                    // row matches and is visible from this face.
                    let visible = |pos: [u32; 3]| {
                        grid.get(pos[0], pos[1], pos[2]) == start_voxel
                            && grid.get_checked(
                                pos[0] as i64 + normal[0],
                                pos[1] as i64 + normal[1],
                                pos[2] as i64 + normal[2],
                            ) == 0
                    };
                    while pos[v] < dims[v] {
                        pos[u] = i;
                        if !visible(pos) {
                            break;
                        }
                        pos[u] += 1;
                        while pos[u] < min_i && visible(pos) {
                            pos[u] += 1;
                        }
                        if pos[u] < min_i {
                            min_i = pos[u];
                        }
                        pos[v] += 1;
                    }
                    if min_i == start_pos[u] || pos[v] == start_pos[v] {
                        continue;
                    }
                    let mut extent = [0u32; 3];
                    extent[u] = min_i - start_pos[u];
                    extent[v] = pos[v] - start_pos[v];

                    let quad_base = base_index + (vertices.len() - first_vertex) as u32;
                    for index in QUAD_INDICES {
                        indices.push(quad_base + index);
                    }
                    for corner in FACE_CORNERS[face] {
                        let mut vert_pos = [
                            start_pos[0] + extent[0] * corner[0],
                            start_pos[1] + extent[1] * corner[1],
                            start_pos[2] + extent[2] * corner[2],
                        ];
                        vert_pos[d] += face as u32 & 1;
                        vertices.push(VoxelVertex {
                            position: Vector3::new(
                                vert_pos[0] as f32 * inv_size - half_size.x,
                                vert_pos[1] as f32 * inv_size - half_size.y,
                                vert_pos[2] as f32 * inv_size - half_size.z,
                            ),
                            color: grid.palette[start_voxel as usize],
                        });
                    }

                    for jj in j..pos[v] {
                        for ii in i..min_i {
                            merged[(ii + jj * dims[u]) as usize] = true;
                        }
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
    use crate::voxel::meshing::NaiveMesher;

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

    fn solid_grid(width: u32, height: u32, depth: u32, voxel: u8) -> VoxelGrid {
        let mut grid = VoxelGrid::new(width, height, depth);
        for z in 0..depth {
            for y in 0..height {
                for x in 0..width {
                    grid.set(x, y, z, voxel);
                }
            }
        }
        grid
    }

    #[test]
    fn all_air_produces_no_vertices() {
        let grid = VoxelGrid::new(8, 8, 8);
        let (vertices, indices, offsets) = mesh_all::<GreedyMesher>(&grid);
        assert!(vertices.is_empty());
        assert!(indices.is_empty());
        assert_eq!(offsets, [0; 6]);
    }

    #[test]
    fn all_solid_produces_one_quad_per_face() {
        let grid = solid_grid(4, 3, 2, 1);
        let (vertices, _, offsets) = mesh_all::<GreedyMesher>(&grid);
        assert_eq!(offsets, [4; 6]);
        assert_eq!(vertices.len(), 24);
    }

    #[test]
    fn all_solid_cube_vertex_count_matches_surface_formula() {
        let (w, h, d) = (2u32, 2u32, 2u32);
        let grid = solid_grid(w, h, d, 1);
        let (vertices, _, _) = mesh_all::<GreedyMesher>(&grid);
        assert_eq!(vertices.len() as u32, 2 * (w * h + w * d + h * d));
    }

    #[test]
    fn solid_cube_positive_x_face() {
        let mut grid = solid_grid(2, 2, 2, 7);
        grid.palette[7] = 0xFF112233;
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let count = GreedyMesher::mesh_face(&grid, 1, 4, &mut vertices, &mut indices);
        assert_eq!(count, 4);
        assert_eq!(indices, vec![4, 5, 6, 6, 7, 4]);
        for vertex in &vertices {
            assert_eq!(vertex.position.x, 0.5);
            assert_eq!(vertex.position.y.abs(), 0.5);
            assert_eq!(vertex.position.z.abs(), 0.5);
            assert_eq!(vertex.color, 0xFF112233);
        }
    }

    #[test]
    fn single_voxel_greedy_matches_naive_but_smaller_grids_merge() {
        let mut grid = VoxelGrid::new(3, 3, 3);
        grid.set(1, 1, 1, 3);
        let (greedy_vertices, _, greedy_offsets) = mesh_all::<GreedyMesher>(&grid);
        let (naive_vertices, _, _) = mesh_all::<NaiveMesher>(&grid);
        assert_eq!(greedy_vertices.len(), 24);
        assert_eq!(naive_vertices.len(), 36);
        assert_eq!(greedy_offsets, [4; 6]);
    }

    #[test]
    fn different_colors_are_not_merged() {
        let mut grid = VoxelGrid::new(2, 1, 1);
        grid.set(0, 0, 0, 1);
        grid.set(1, 0, 0, 2);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        // +Y face sees two quads of different palette entries.
        let count = GreedyMesher::mesh_face(&grid, 3, 0, &mut vertices, &mut indices);
        assert_eq!(count, 8);
    }

    #[test]
    fn meshing_is_idempotent() {
        let mut grid = solid_grid(5, 4, 3, 2);
        grid.set(2, 2, 1, 0);
        grid.set(1, 0, 2, 9);
        let first = mesh_all::<GreedyMesher>(&grid);
        let second = mesh_all::<GreedyMesher>(&grid);
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2);
        assert_eq!(first.0.len(), second.0.len());
        for (a, b) in first.0.iter().zip(&second.0) {
            assert_eq!(a.position, b.position);
            assert_eq!(a.color, b.color);
        }
    }

    #[test]
    fn vertex_count_stays_under_bound() {
        // A solid blob with a carved tunnel, the kind of shape real models
        // have, stays well within 3 vertices per cell.
        let mut grid = solid_grid(16, 16, 16, 1);
        for z in 0..16 {
            for x in 0..16 {
                grid.set(x, 7, z, 0);
                grid.set(x, 8, z, 0);
            }
        }
        let (vertices, _, _) = mesh_all::<GreedyMesher>(&grid);
        assert!(vertices.len() <= 3 * 16 * 16 * 16);
    }
}
