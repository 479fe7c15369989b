use criterion::{criterion_group, criterion_main, Criterion};
use voxen::renderer::vertex::VoxelVertex;
use voxen::voxel::greedy_meshing::GreedyMesher;
use voxen::voxel::grid::VoxelGrid;
use voxen::voxel::meshing::{Mesher, NaiveMesher};

fn terrain_grid(size: u32) -> VoxelGrid {
    let mut grid = VoxelGrid::new(size, size, size);
    for z in 0..size {
        for x in 0..size {
            // Rolling heightmap with a cave band, enough structure to keep
            // the meshers honest.
            let height = size / 2
                + ((x as f32 * 0.4).sin() * 4.) as u32 % (size / 4)
                + ((z as f32 * 0.3).cos().abs() * 3.) as u32 % (size / 8);
            for y in 0..height.min(size) {
                let voxel = if y > size / 3 && y < size / 2 && (x + z) % 7 == 0 {
                    0
                } else {
                    1 + ((x + y + z) % 3) as u8
                };
                grid.set(x, y, z, voxel);
            }
        }
    }
    grid
}

fn mesh_all<M: Mesher>(grid: &VoxelGrid) -> usize {
    let mut vertices: Vec<VoxelVertex> = Vec::new();
    let mut indices = Vec::new();
    let mut base_index = 0;
    for face in 0..6 {
        base_index += M::mesh_face(grid, face, base_index, &mut vertices, &mut indices);
    }
    vertices.len()
}

fn bench_meshing(c: &mut Criterion) {
    let grid = terrain_grid(32);
    c.bench_function("greedy 32^3", |b| {
        b.iter(|| mesh_all::<GreedyMesher>(&grid))
    });
    c.bench_function("naive 32^3", |b| b.iter(|| mesh_all::<NaiveMesher>(&grid)));
}

criterion_group!(benches, bench_meshing);
criterion_main!(benches);
