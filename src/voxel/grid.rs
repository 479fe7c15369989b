use anyhow::{anyhow, Context, Result};
use log::debug;
use nalgebra::Vector3;
use std::path::Path;

pub type Voxel = u8;

/// Dense voxel grid in x-fastest order with a 256-entry RGBA palette and a
/// content hash. The hash is the identity used by the drawer's vertex cache,
/// so it depends only on contents, never on addresses. `last_hash`,
/// `first_vertex` and `offsets` are memo fields owned by the drawer:
/// the hash at last mesh generation, the start of this grid's meshes in the
/// shared vertex buffer, and the per-face vertex counts in face order
/// -X, +X, -Y, +Y, -Z, +Z.
pub struct VoxelGrid {
    data: Vec<Voxel>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub hash: u64,
    pub palette: [u32; 256],
    pub last_hash: u64,
    pub first_vertex: u32,
    pub offsets: [u32; 6],
}

impl VoxelGrid {
    pub fn new(width: u32, height: u32, depth: u32) -> VoxelGrid {
        let data = vec![0; (width * height * depth) as usize];
        VoxelGrid {
            hash: hash_memory64(&data),
            data,
            width,
            height,
            depth,
            palette: [0; 256],
            last_hash: 0,
            first_vertex: u32::MAX,
            offsets: [0; 6],
        }
    }

    #[inline]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (x + y * self.width + z * self.width * self.height) as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> Voxel {
        self.data[self.index(x, y, z)]
    }

    /// Bounds-checked read, out-of-range coordinates are air. The mesher
    /// uses this at grid edges.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64, z: i64) -> Voxel {
        if x >= 0
            && y >= 0
            && z >= 0
            && (x as u32) < self.width
            && (y as u32) < self.height
            && (z as u32) < self.depth
        {
            self.get(x as u32, y as u32, z as u32)
        } else {
            0
        }
    }

    /// Writes a voxel and folds the new value into the content hash. The
    /// combine is order-dependent, so identical mutation sequences produce
    /// identical hashes.
    pub fn set(&mut self, x: u32, y: u32, z: u32, voxel: Voxel) {
        let index = self.index(x, y, z);
        self.data[index] = voxel;
        self.hash = hash_combine64(&[self.hash, voxel as u64]);
    }

    /// Recomputes the hash over the whole buffer. Used after bulk loads.
    pub fn rehash(&mut self) {
        self.hash = hash_memory64(&self.data);
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.data
    }

    pub fn copy_voxels_from(&mut self, voxels: &[Voxel]) {
        self.data.copy_from_slice(voxels);
        self.rehash();
    }

    /// Scale that makes the longest axis unit-length, and the grid's
    /// half-extents under that scale. The mesh is centred so its bounding
    /// box is symmetric around the origin.
    pub fn size(&self) -> (Vector3<f32>, f32) {
        let inv_size = 1. / self.width.max(self.height).max(self.depth) as f32;
        let half_size = Vector3::new(
            inv_size * 0.5 * self.width as f32,
            inv_size * 0.5 * self.height as f32,
            inv_size * 0.5 * self.depth as f32,
        );
        (half_size, inv_size)
    }

    pub fn from_vox_bytes(buffer: &[u8]) -> Result<VoxelGrid> {
        let scene = dot_vox::load_bytes(buffer).map_err(|error| anyhow!("{error}"))?;
        let model = scene
            .models
            .first()
            .ok_or_else(|| anyhow!("voxel file contains no models"))?;
        // The format stores y and z swapped relative to the grid layout.
        let mut grid = VoxelGrid::new(model.size.x, model.size.z, model.size.y);
        for (dst, color) in grid.palette[1..].iter_mut().zip(&scene.palette) {
            *dst = u32::from_le_bytes([color.r, color.g, color.b, color.a]);
        }
        for voxel in &model.voxels {
            // The decoder's palette indices are zero-based, grid value 0 is
            // reserved for air.
            let index = grid.index(voxel.x as u32, voxel.z as u32, voxel.y as u32);
            grid.data[index] = voxel.i.saturating_add(1);
        }
        grid.rehash();
        debug!(
            "voxel model loaded, \x1B[1msize\x1B[0m: {}x{}x{}",
            grid.width, grid.height, grid.depth
        );
        Ok(grid)
    }

    pub fn from_vox_file(path: impl AsRef<Path>) -> Result<VoxelGrid> {
        let buffer = std::fs::read(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        VoxelGrid::from_vox_bytes(&buffer)
    }
}

const HASH_SEED: u32 = 1;

/// MurmurHash2, 64-bit variant with a fixed seed.
pub fn hash_memory64(data: &[u8]) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;
    let mut h = HASH_SEED as u64 ^ (data.len() as u64).wrapping_mul(M);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u64;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u64) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }
    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

pub fn hash_combine64(hashes: &[u64]) -> u64 {
    let mut hash = 0u64;
    for value in hashes {
        hash ^= value
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(hash << 6)
            .wrapping_add(hash >> 2);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let mut grid = VoxelGrid::new(4, 3, 2);
        grid.set(3, 2, 1, 7);
        assert_eq!(grid.get(3, 2, 1), 7);
        assert_eq!(grid.get(0, 0, 0), 0);
    }

    #[test]
    fn checked_reads_outside_are_air() {
        let mut grid = VoxelGrid::new(2, 2, 2);
        grid.set(1, 1, 1, 5);
        assert_eq!(grid.get_checked(1, 1, 1), 5);
        assert_eq!(grid.get_checked(-1, 0, 0), 0);
        assert_eq!(grid.get_checked(2, 0, 0), 0);
        assert_eq!(grid.get_checked(0, 0, 17), 0);
    }

    #[test]
    fn hash_is_deterministic_over_set_sequences() {
        let build = || {
            let mut grid = VoxelGrid::new(3, 3, 3);
            grid.set(0, 0, 0, 1);
            grid.set(1, 1, 1, 2);
            grid.set(2, 2, 2, 3);
            grid.hash
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn hash_depends_on_mutation_order() {
        let mut a = VoxelGrid::new(2, 2, 2);
        a.set(0, 0, 0, 1);
        a.set(1, 0, 0, 2);
        let mut b = VoxelGrid::new(2, 2, 2);
        b.set(1, 0, 0, 2);
        b.set(0, 0, 0, 1);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn rehash_matches_content_not_history() {
        let mut a = VoxelGrid::new(2, 2, 2);
        a.set(0, 0, 0, 1);
        a.set(0, 0, 0, 0);
        a.rehash();
        let mut b = VoxelGrid::new(2, 2, 2);
        b.rehash();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn vox_bytes_load_with_axis_swap() {
        // Minimal MagicaVoxel file: one 2x2x2 model with a single voxel of
        // palette index 1 at the origin.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"VOX ");
        bytes.extend_from_slice(&150u32.to_le_bytes());
        bytes.extend_from_slice(b"MAIN");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&44u32.to_le_bytes());
        bytes.extend_from_slice(b"SIZE");
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(b"XYZI");
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 1]);

        let grid = VoxelGrid::from_vox_bytes(&bytes).unwrap();
        assert_eq!((grid.width, grid.height, grid.depth), (2, 2, 2));
        // Decoder indices are zero-based, grid values leave 0 for air.
        assert_eq!(grid.get(0, 0, 0), 2);
        assert_eq!(grid.voxels().iter().filter(|&&v| v != 0).count(), 1);
        assert_eq!(grid.hash, hash_memory64(grid.voxels()));
    }

    #[test]
    fn size_scales_longest_axis_to_unit() {
        let grid = VoxelGrid::new(2, 2, 2);
        let (half_size, inv_size) = grid.size();
        assert_eq!(inv_size, 0.5);
        assert_eq!(half_size, Vector3::new(0.5, 0.5, 0.5));

        let grid = VoxelGrid::new(4, 2, 1);
        let (half_size, inv_size) = grid.size();
        assert_eq!(inv_size, 0.25);
        assert_eq!(half_size, Vector3::new(0.5, 0.25, 0.125));

        let grid = VoxelGrid::new(1, 1, 1);
        let (_, inv_size) = grid.size();
        assert_eq!(inv_size, 1.);
    }
}
