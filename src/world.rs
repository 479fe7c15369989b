use crate::camera::Camera;
use crate::config::Config;
use crate::ecs::{ComponentTable, Entity, EntityAllocator};
use crate::input::InputState;
use crate::math::{Obb, Transform};
use crate::voxel::grid::VoxelGrid;
use crate::voxel::VoxelView;
use nalgebra::{UnitQuaternion, Vector3};

/// All simulation state: component tables, the two engine cameras and the
/// sun. The shadow camera owns cull slot 0, the main camera slot 1.
pub struct World {
    pub entities: EntityAllocator,
    pub transforms: ComponentTable<Transform>,
    pub grids: ComponentTable<VoxelGrid>,
    pub views: ComponentTable<VoxelView>,
    pub obbs: ComponentTable<Obb>,
    pub cameras: ComponentTable<Camera>,
    pub main_camera: Entity,
    pub shadow_camera: Entity,
    pub sun_dir: Vector3<f32>,
    pub sun_ambient: f32,
}

impl World {
    pub fn new() -> World {
        let mut entities = EntityAllocator::new();
        let mut cameras = ComponentTable::new();
        let shadow_camera = entities.create();
        cameras.insert(shadow_camera, Camera::orthographic(1));
        let main_camera = entities.create();
        let mut camera = Camera::perspective(2);
        camera.position = Vector3::new(0., 1., -3.);
        cameras.insert(main_camera, camera);
        World {
            entities,
            transforms: ComponentTable::new(),
            grids: ComponentTable::new(),
            views: ComponentTable::new(),
            obbs: ComponentTable::new(),
            cameras,
            main_camera,
            shadow_camera,
            sun_dir: Vector3::new(0.03, 1.9, 0.09).normalize(),
            sun_ambient: 0.1,
        }
    }

    /// Creates an entity drawing `grid` at `transform`.
    pub fn spawn_model(&mut self, grid: VoxelGrid, transform: Transform) -> Entity {
        let entity = self.entities.create();
        self.grids.insert(entity, grid);
        self.transforms.insert(entity, transform);
        self.obbs.insert(entity, Obb::default());
        self.views.insert(
            entity,
            VoxelView {
                grid: entity,
                cull_mask: 0,
            },
        );
        entity
    }

    pub fn despawn_models(&mut self) {
        let entities: Vec<Entity> = self.views.entities().to_vec();
        for entity in entities {
            self.grids.remove(entity);
            self.transforms.remove(entity);
            self.obbs.remove(entity);
            self.views.remove(entity);
            self.entities.destroy(entity);
        }
    }

    /// A small scene to look at when no package is loaded: a ground slab
    /// and a few coloured blocks.
    pub fn populate_demo(&mut self) {
        let mut ground = VoxelGrid::new(32, 2, 32);
        ground.palette[1] = 0xFF4A6A4A;
        for z in 0..32 {
            for x in 0..32 {
                ground.set(x, 0, z, 1);
                ground.set(x, 1, z, 1);
            }
        }
        self.spawn_model(
            ground,
            Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(0., -1., 0.),
                scale: 8.,
            },
        );

        let mut cube = VoxelGrid::new(2, 2, 2);
        cube.palette[7] = 0xFF112233;
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    cube.set(x, y, z, 7);
                }
            }
        }
        self.spawn_model(
            cube,
            Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(0., 0.5, 0.),
                scale: 1.,
            },
        );

        let mut sphere = VoxelGrid::new(17, 17, 17);
        sphere.palette[3] = 0xFF2040C0;
        for z in 0..17i32 {
            for y in 0..17i32 {
                for x in 0..17i32 {
                    let d = (x - 8) * (x - 8) + (y - 8) * (y - 8) + (z - 8) * (z - 8);
                    if d <= 64 {
                        sphere.set(x as u32, y as u32, z as u32, 3);
                    }
                }
            }
        }
        self.spawn_model(
            sphere,
            Transform {
                rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.6),
                position: Vector3::new(2.5, 0.7, 1.5),
                scale: 1.4,
            },
        );
    }

    /// Applies input to the main camera, refreshes both cameras' matrices
    /// and repoints the sun camera.
    pub fn update(&mut self, dt: f32, input: &InputState, config: &Config, width: u32, height: u32) {
        let camera = self.cameras.get_mut(self.main_camera).unwrap();
        camera.movement_speed = config.get_float("Camera.movement_speed");
        camera.rotation_speed = config.get_float("Camera.rotation_speed");
        camera.set_fovy(config.get_float("Camera.fovy").to_radians());
        camera.set_pressed(input.movement_flags);
        if input.mouse_dx != 0. || input.mouse_dy != 0. {
            camera.rotate(-input.mouse_dy, input.mouse_dx, 0.);
        }
        camera.update(dt, width, height);
        camera.update_projview();

        let shadow_camera = self.cameras.get_mut(self.shadow_camera).unwrap();
        shadow_camera.update_sun(
            self.sun_dir,
            config.get_float("Render.shadow_extent"),
            config.get_float("Render.shadow_near"),
            config.get_float("Render.shadow_far"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_creates_all_components() {
        let mut world = World::new();
        let grid = VoxelGrid::new(2, 2, 2);
        let entity = world.spawn_model(grid, Transform::identity());
        assert!(world.grids.get(entity).is_some());
        assert!(world.transforms.get(entity).is_some());
        assert!(world.obbs.get(entity).is_some());
        assert_eq!(world.views.get(entity).unwrap().grid, entity);
    }

    #[test]
    fn despawn_clears_models_but_not_cameras() {
        let mut world = World::new();
        world.populate_demo();
        assert!(world.views.len() > 0);
        world.despawn_models();
        assert_eq!(world.views.len(), 0);
        assert_eq!(world.cameras.len(), 2);
    }

    #[test]
    fn camera_cull_slots() {
        let world = World::new();
        assert_eq!(world.cameras.get(world.shadow_camera).unwrap().cull_mask, 1);
        assert_eq!(world.cameras.get(world.main_camera).unwrap().cull_mask, 2);
    }
}
