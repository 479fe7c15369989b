use crate::math::Transform;
use crate::voxel::grid::VoxelGrid;
use crate::world::World;
use anyhow::{bail, ensure, Context, Result};
use log::{error, info};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::path::Path;

/// Binary little-endian scene package:
///
/// ```text
/// u64   magic
/// SceneInfo:
///   Vec3 camera_position
///   Vec3 camera_up
///   Vec3 camera_rotation
///   u32  vox_components_offset (bytes from file start)
///   u32  num_vox_components
/// per model:
///   Transform (32 B: quat rotation, vec3 position, f32 scale)
///   u32[256]  palette
///   u32 w, h, d
///   u8[w*h*d] voxels
/// ```
const PACKAGE_MAGIC: u64 = 22813376969420;

const HEADER_SIZE: usize = 8 + 3 * 12 + 2 * 4;

pub fn encode(world: &World) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&PACKAGE_MAGIC.to_le_bytes());
    let camera = world.cameras.get(world.main_camera).unwrap();
    write_vec3(&mut out, camera.position);
    write_vec3(&mut out, camera.up);
    write_vec3(&mut out, camera.rotation);
    out.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&(world.grids.len() as u32).to_le_bytes());

    for (entity, grid) in world.grids.iter() {
        let transform = world
            .transforms
            .get(entity)
            .copied()
            .unwrap_or_else(Transform::identity);
        write_transform(&mut out, &transform);
        for color in &grid.palette {
            out.extend_from_slice(&color.to_le_bytes());
        }
        out.extend_from_slice(&grid.width.to_le_bytes());
        out.extend_from_slice(&grid.height.to_le_bytes());
        out.extend_from_slice(&grid.depth.to_le_bytes());
        out.extend_from_slice(grid.voxels());
    }
    out
}

/// Replaces the world's models with the package contents and restores the
/// camera. A bad magic or truncated file is rejected whole; no partial
/// restoration happens.
pub fn decode(bytes: &[u8], world: &mut World) -> Result<()> {
    let mut reader = Reader { bytes, cursor: 0 };
    let magic = reader.u64()?;
    ensure!(magic == PACKAGE_MAGIC, "bad package magic {magic:#x}");
    let camera_position = reader.vec3()?;
    let camera_up = reader.vec3()?;
    let camera_rotation = reader.vec3()?;
    let offset = reader.u32()? as usize;
    let count = reader.u32()?;
    ensure!(offset <= bytes.len(), "model offset outside the package");

    // Parse everything before touching the world, so failures leave it
    // untouched.
    let mut models = Vec::new();
    reader.cursor = offset;
    for _ in 0..count {
        let transform = reader.transform()?;
        let mut palette = [0u32; 256];
        for color in palette.iter_mut() {
            *color = reader.u32()?;
        }
        let width = reader.u32()?;
        let height = reader.u32()?;
        let depth = reader.u32()?;
        let voxels = reader.slice((width * height * depth) as usize)?;
        models.push((transform, palette, width, height, depth, voxels));
    }

    world.despawn_models();
    let camera = world.cameras.get_mut(world.main_camera).unwrap();
    camera.position = camera_position;
    camera.up = camera_up;
    camera.rotation = camera_rotation;
    for (transform, palette, width, height, depth, voxels) in models {
        let mut grid = VoxelGrid::new(width, height, depth);
        grid.palette = palette;
        grid.copy_voxels_from(voxels);
        world.spawn_model(grid, transform);
    }
    info!("scene package loaded, \x1B[1mmodels\x1B[0m: {count}");
    Ok(())
}

pub fn save_scene(world: &World, path: impl AsRef<Path>) -> Result<()> {
    let bytes = encode(world);
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
    info!("scene saved to {}", path.as_ref().display());
    Ok(())
}

pub fn load_scene(world: &mut World, path: impl AsRef<Path>) -> Result<()> {
    let bytes = std::fs::read(path.as_ref())
        .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
    decode(&bytes, world).inspect_err(|err| error!("failed to load package: {err}"))
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.cursor + len > self.bytes.len() {
            bail!("truncated package");
        }
        let slice = &self.bytes[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.slice(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.slice(4)?.try_into().unwrap()))
    }

    fn vec3(&mut self) -> Result<Vector3<f32>> {
        Ok(Vector3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn transform(&mut self) -> Result<Transform> {
        let x = self.f32()?;
        let y = self.f32()?;
        let z = self.f32()?;
        let w = self.f32()?;
        let position = self.vec3()?;
        let scale = self.f32()?;
        Ok(Transform {
            rotation: UnitQuaternion::new_unchecked(Quaternion::new(w, x, y, z)),
            position,
            scale,
        })
    }
}

fn write_vec3(out: &mut Vec<u8>, v: Vector3<f32>) {
    out.extend_from_slice(&v.x.to_le_bytes());
    out.extend_from_slice(&v.y.to_le_bytes());
    out.extend_from_slice(&v.z.to_le_bytes());
}

fn write_transform(out: &mut Vec<u8>, transform: &Transform) {
    let q = transform.rotation.quaternion();
    out.extend_from_slice(&q.i.to_le_bytes());
    out.extend_from_slice(&q.j.to_le_bytes());
    out.extend_from_slice(&q.k.to_le_bytes());
    out.extend_from_slice(&q.w.to_le_bytes());
    write_vec3(out, transform.position);
    out.extend_from_slice(&transform.scale.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn sample_world() -> World {
        let mut world = World::new();
        let mut grid = VoxelGrid::new(3, 2, 4);
        grid.palette[5] = 0xFFAABBCC;
        grid.set(0, 0, 0, 5);
        grid.set(2, 1, 3, 5);
        grid.set(1, 1, 2, 9);
        world.spawn_model(
            grid,
            Transform {
                rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5),
                position: Vector3::new(1., 2., 3.),
                scale: 2.5,
            },
        );
        world
    }

    #[test]
    fn round_trip_preserves_grids_and_transforms() {
        let world = sample_world();
        let (entity, original) = world.grids.iter().next().unwrap();
        let original_hash = original.hash;
        let original_transform = *world.transforms.get(entity).unwrap();

        let bytes = encode(&world);
        let mut restored = World::new();
        decode(&bytes, &mut restored).unwrap();

        assert_eq!(restored.grids.len(), 1);
        let (restored_entity, grid) = restored.grids.iter().next().unwrap();
        assert_eq!(grid.voxels(), original.voxels());
        assert_eq!(grid.palette, original.palette);
        assert_eq!(grid.hash, original_hash);
        let transform = restored.transforms.get(restored_entity).unwrap();
        assert_eq!(transform.position, original_transform.position);
        assert_eq!(transform.scale, original_transform.scale);
        assert!(
            (transform.rotation.quaternion().coords
                - original_transform.rotation.quaternion().coords)
                .norm()
                < 1e-6
        );
    }

    #[test]
    fn round_trip_preserves_camera() {
        let mut world = sample_world();
        let camera = world.cameras.get_mut(world.main_camera).unwrap();
        camera.position = Vector3::new(4., 5., 6.);
        camera.rotation = Vector3::new(0.1, 0.2, 0.3);
        let bytes = encode(&world);
        let mut restored = World::new();
        decode(&bytes, &mut restored).unwrap();
        let camera = restored.cameras.get(restored.main_camera).unwrap();
        assert_eq!(camera.position, Vector3::new(4., 5., 6.));
        assert_eq!(camera.rotation, Vector3::new(0.1, 0.2, 0.3));
    }

    #[test]
    fn bad_magic_is_rejected_without_touching_the_world() {
        let world = sample_world();
        let mut bytes = encode(&world);
        bytes[0] ^= 0xFF;
        let mut restored = World::new();
        restored.populate_demo();
        let models_before = restored.grids.len();
        assert!(decode(&bytes, &mut restored).is_err());
        assert_eq!(restored.grids.len(), models_before);
    }

    #[test]
    fn truncated_package_is_rejected() {
        let world = sample_world();
        let bytes = encode(&world);
        let mut restored = World::new();
        assert!(decode(&bytes[..bytes.len() - 5], &mut restored).is_err());
    }
}
