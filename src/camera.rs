use crate::math::{look_at, orthographic_reversed, perspective_reversed_infinite};
use nalgebra::{Matrix4, Vector3};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraKind {
    Ortho,
    Persp,
}

pub const CAMERA_PRESSED_FORWARD: u32 = 1 << 0;
pub const CAMERA_PRESSED_BACK: u32 = 1 << 1;
pub const CAMERA_PRESSED_LEFT: u32 = 1 << 2;
pub const CAMERA_PRESSED_RIGHT: u32 = 1 << 3;
pub const CAMERA_PRESSED_UP: u32 = 1 << 4;
pub const CAMERA_PRESSED_DOWN: u32 = 1 << 5;

/// A camera participating in rendering and culling. The bit index of
/// `cull_mask` names this camera's slot in per-camera output buffers; at
/// most 8 cameras may cull in one frame. Projection and view matrices are
/// recomputed lazily when position, rotation or projection parameters
/// change.
pub struct Camera {
    pub kind: CameraKind,
    pub position: Vector3<f32>,
    pub up: Vector3<f32>,
    /// Direction the camera looks along. Orthographic cameras backface-cull
    /// against this vector, so it must be kept in sync when the camera is
    /// repositioned.
    pub front: Vector3<f32>,
    pub rotation: Vector3<f32>,
    pub fovy: f32,
    pub aspect_ratio: f32,
    pub z_near: f32,
    pub movement_speed: f32,
    pub rotation_speed: f32,
    pub cull_mask: u32,
    pressed: u32,
    projection: Matrix4<f32>,
    view: Matrix4<f32>,
    projview: Matrix4<f32>,
    projection_dirty: bool,
    view_dirty: bool,
}

impl Camera {
    pub fn perspective(cull_mask: u32) -> Camera {
        Camera {
            kind: CameraKind::Persp,
            position: Vector3::zeros(),
            up: Vector3::y(),
            front: Vector3::new(0., 0., 1.),
            rotation: Vector3::zeros(),
            fovy: std::f32::consts::FRAC_PI_3,
            aspect_ratio: 16. / 9.,
            z_near: 0.01,
            movement_speed: 2.,
            rotation_speed: 0.01,
            cull_mask,
            pressed: 0,
            projection: Matrix4::identity(),
            view: Matrix4::identity(),
            projview: Matrix4::identity(),
            projection_dirty: true,
            view_dirty: true,
        }
    }

    pub fn orthographic(cull_mask: u32) -> Camera {
        Camera {
            kind: CameraKind::Ortho,
            ..Camera::perspective(cull_mask)
        }
    }

    pub fn pressed(&mut self, flags: u32) {
        self.pressed |= flags;
    }

    pub fn set_pressed(&mut self, flags: u32) {
        self.pressed = flags;
    }

    pub fn unpressed(&mut self, flags: u32) {
        self.pressed &= !flags;
    }

    pub fn rotate(&mut self, dx: f32, dy: f32, dz: f32) {
        self.rotation.x += dx * self.rotation_speed;
        self.rotation.y += dy * self.rotation_speed;
        self.rotation.z += dz * self.rotation_speed;
        self.view_dirty = true;
    }

    /// Integrates held movement keys and recomputes the front vector from
    /// the Euler rotation, which is really spherical coordinates.
    pub fn update(&mut self, dt: f32, window_width: u32, window_height: u32) {
        self.front = Vector3::new(
            self.rotation.x.cos() * self.rotation.y.sin(),
            self.rotation.x.sin(),
            self.rotation.x.cos() * self.rotation.y.cos(),
        );
        let speed = self.movement_speed;
        if self.pressed & (CAMERA_PRESSED_FORWARD | CAMERA_PRESSED_BACK) != 0 {
            let plane = Vector3::new(1., 1., 1.) - self.up;
            let direction = -self.front.component_mul(&plane);
            if self.pressed & CAMERA_PRESSED_FORWARD != 0 {
                self.position += direction * speed * dt;
            }
            if self.pressed & CAMERA_PRESSED_BACK != 0 {
                self.position -= direction * speed * dt;
            }
        }
        if self.pressed & (CAMERA_PRESSED_LEFT | CAMERA_PRESSED_RIGHT) != 0 {
            let right = self.front.cross(&self.up);
            if self.pressed & CAMERA_PRESSED_RIGHT != 0 {
                self.position += right * speed * dt;
            }
            if self.pressed & CAMERA_PRESSED_LEFT != 0 {
                self.position -= right * speed * dt;
            }
        }
        if self.pressed & CAMERA_PRESSED_UP != 0 {
            self.position += self.up * speed * dt;
        }
        if self.pressed & CAMERA_PRESSED_DOWN != 0 {
            self.position -= self.up * speed * dt;
        }
        let aspect_ratio = window_width as f32 / window_height as f32;
        if aspect_ratio != self.aspect_ratio {
            self.aspect_ratio = aspect_ratio;
            self.projection_dirty = true;
        }
        self.view_dirty = true;
    }

    pub fn set_fovy(&mut self, fovy: f32) {
        if fovy != self.fovy {
            self.fovy = fovy;
            self.projection_dirty = true;
        }
    }

    pub fn projection(&mut self) -> Matrix4<f32> {
        if self.projection_dirty {
            self.projection =
                perspective_reversed_infinite(self.fovy, self.aspect_ratio, self.z_near);
            self.projection_dirty = false;
        }
        self.projection
    }

    pub fn view(&mut self) -> Matrix4<f32> {
        if self.view_dirty {
            self.view = look_at(self.position, self.position + self.front, self.up);
            self.view_dirty = false;
        }
        self.view
    }

    pub fn update_projview(&mut self) {
        self.projview = self.projection() * self.view();
    }

    pub fn projview(&self) -> Matrix4<f32> {
        self.projview
    }

    /// Points the orthographic sun camera: projection from the shadow
    /// extents, view along the sun direction, front kept consistent for
    /// backface culling.
    pub fn update_sun(&mut self, sun_dir: Vector3<f32>, extent: f32, z_near: f32, z_far: f32) {
        self.projection = orthographic_reversed(-extent, extent, -extent, extent, z_near, z_far);
        self.position = sun_dir * 20.;
        self.front = -sun_dir;
        self.up = Vector3::x();
        self.view = look_at(self.position, self.position + self.front, self.up);
        self.projection_dirty = false;
        self.view_dirty = false;
        self.projview = self.projection * self.view;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cull_mask_slots_are_disjoint() {
        let main = Camera::perspective(1);
        let sun = Camera::orthographic(2);
        assert_eq!(main.cull_mask & sun.cull_mask, 0);
    }

    #[test]
    fn update_recomputes_front_from_rotation() {
        let mut camera = Camera::perspective(1);
        camera.update(0., 1280, 720);
        assert!((camera.front - Vector3::new(0., 0., 1.)).norm() < 1e-6);
        camera.rotation.y = std::f32::consts::FRAC_PI_2;
        camera.update(0., 1280, 720);
        assert!((camera.front - Vector3::new(1., 0., 0.)).norm() < 1e-6);
    }

    #[test]
    fn movement_follows_held_keys() {
        let mut camera = Camera::perspective(1);
        camera.pressed(CAMERA_PRESSED_UP);
        camera.update(1., 1280, 720);
        assert!(camera.position.y > 0.);
        camera.unpressed(CAMERA_PRESSED_UP);
        let before = camera.position;
        camera.update(1., 1280, 720);
        assert_eq!(camera.position, before);
    }

    #[test]
    fn sun_camera_faces_against_sun_direction() {
        let mut camera = Camera::orthographic(2);
        let sun_dir = Vector3::new(0., 1., 0.);
        camera.update_sun(sun_dir, 10., 0.1, 40.);
        assert!((camera.front + sun_dir).norm() < 1e-6);
        assert_eq!(camera.position, Vector3::new(0., 20., 0.));
    }
}
