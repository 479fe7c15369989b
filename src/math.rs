use nalgebra::{Matrix4, UnitQuaternion, Vector3, Vector4};

/// Instance transform as the GPU sees it: quaternion rotation (xyzw),
/// translation, uniform scale. 32 bytes, streamed into the transform ring
/// verbatim.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Transform {
    pub rotation: UnitQuaternion<f32>,
    pub position: Vector3<f32>,
    pub scale: f32,
}

impl Transform {
    pub fn identity() -> Transform {
        Transform {
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            scale: 1.,
        }
    }
}

/// Oriented bounding box as eight world-space corners. The corner order is
/// canonical: index bit 2 selects +x, bit 1 +y, bit 0 +z, so corner 0 is
/// (-,-,-) and corner 7 is (+,+,+). The frustum test, the face tables of the
/// direct drawing backend and the debug drawer all rely on this order.
#[derive(Clone, Copy, Debug)]
pub struct Obb {
    pub corners: [Vector3<f32>; 8],
}

impl Default for Obb {
    fn default() -> Obb {
        Obb {
            corners: [Vector3::zeros(); 8],
        }
    }
}

pub const OBB_CORNER_SIGNS: [Vector3<f32>; 8] = [
    Vector3::new(-1., -1., -1.),
    Vector3::new(-1., -1., 1.),
    Vector3::new(-1., 1., -1.),
    Vector3::new(-1., 1., 1.),
    Vector3::new(1., -1., -1.),
    Vector3::new(1., -1., 1.),
    Vector3::new(1., 1., -1.),
    Vector3::new(1., 1., 1.),
];

// Zero-thickness boxes would quantize away during culling.
const OBB_SCALE_EPSILON: f32 = 0.01;

impl Obb {
    pub fn from_half_size(half_size: Vector3<f32>, transform: &Transform) -> Obb {
        let basis = [
            transform.rotation * Vector3::new(half_size.x, 0., 0.),
            transform.rotation * Vector3::new(0., half_size.y, 0.),
            transform.rotation * Vector3::new(0., 0., half_size.z),
        ];
        let scale = transform.scale + OBB_SCALE_EPSILON;
        let mut corners = [Vector3::zeros(); 8];
        for (corner, signs) in corners.iter_mut().zip(OBB_CORNER_SIGNS) {
            *corner = basis[0] * (signs.x * scale)
                + basis[1] * (signs.y * scale)
                + basis[2] * (signs.z * scale)
                + transform.position;
        }
        Obb { corners }
    }

    pub fn center(&self) -> Vector3<f32> {
        (self.corners[0] + self.corners[7]) / 2.
    }
}

/// Conservative OBB-vs-frustum test in clip space. Projection is assumed to
/// have an infinite far plane and reversed depth, so the near test is z >= 0
/// and there is no far test. Returns true when the box may be visible.
pub fn frustum_intersects_obb(projview: &Matrix4<f32>, obb: &Obb) -> bool {
    let mut points = [Vector4::zeros(); 8];
    for (point, corner) in points.iter_mut().zip(&obb.corners) {
        *point = projview * Vector4::new(corner.x, corner.y, corner.z, 1.);
        // Early accept as soon as any corner lands inside the clip region.
        if -point.w <= point.x
            && point.x <= point.w
            && -point.w <= point.y
            && point.y <= point.w
            && point.z >= 0.
        {
            return true;
        }
    }
    if points.iter().all(|p| p.x > p.w) {
        return false;
    }
    if points.iter().all(|p| p.x < -p.w) {
        return false;
    }
    if points.iter().all(|p| p.y > p.w) {
        return false;
    }
    if points.iter().all(|p| p.y < -p.w) {
        return false;
    }
    if points.iter().all(|p| p.z < 0.) {
        return false;
    }
    true
}

/// Perspective projection with an infinite far plane and reversed depth
/// (near maps to 1, infinity to 0), including the Vulkan y flip.
pub fn perspective_reversed_infinite(fovy: f32, aspect_ratio: f32, z_near: f32) -> Matrix4<f32> {
    let f = 1. / (fovy * 0.5).tan();
    #[rustfmt::skip]
    let matrix = Matrix4::new(
        f / aspect_ratio, 0., 0., 0.,
        0., -f, 0., 0.,
        0., 0., 0., z_near,
        0., 0., -1., 0.,
    );
    matrix
}

/// Orthographic projection with reversed depth (near maps to 1, far to 0)
/// and the Vulkan y flip.
pub fn orthographic_reversed(
    left: f32,
    right: f32,
    bottom: f32,
    top: f32,
    z_near: f32,
    z_far: f32,
) -> Matrix4<f32> {
    #[rustfmt::skip]
    let matrix = Matrix4::new(
        2. / (right - left), 0., 0., -(right + left) / (right - left),
        0., -2. / (top - bottom), 0., -(top + bottom) / (top - bottom),
        0., 0., 1. / (z_far - z_near), z_far / (z_far - z_near),
        0., 0., 0., 1.,
    );
    matrix
}

pub fn look_at(eye: Vector3<f32>, target: Vector3<f32>, up: Vector3<f32>) -> Matrix4<f32> {
    Matrix4::look_at_rh(&eye.into(), &target.into(), &up)
}

pub fn nearest_pow2(value: u32) -> u32 {
    if value == 0 {
        return 1;
    }
    1 << value.ilog2()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn identity_obb_corners() {
        let obb = Obb::from_half_size(
            Vector3::new(0.5, 0.5, 0.5),
            &Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(1., 2., 3.),
                scale: 1.,
            },
        );
        let extent = 0.5 * (1. + OBB_SCALE_EPSILON);
        assert!((obb.corners[0] - Vector3::new(1. - extent, 2. - extent, 3. - extent)).norm() < 1e-5);
        assert!((obb.corners[7] - Vector3::new(1. + extent, 2. + extent, 3. + extent)).norm() < 1e-5);
        assert!((obb.center() - Vector3::new(1., 2., 3.)).norm() < 1e-5);
    }

    #[test]
    fn rotated_obb_swaps_extents() {
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        let obb = Obb::from_half_size(
            Vector3::new(2., 1., 1.),
            &Transform {
                rotation,
                position: Vector3::zeros(),
                scale: 1.,
            },
        );
        let max_x = obb.corners.iter().map(|c| c.x.abs()).fold(0., f32::max);
        let max_y = obb.corners.iter().map(|c| c.y.abs()).fold(0., f32::max);
        // The long x half-extent now lies along y.
        assert!(max_y > 1.9 && max_y < 2.1);
        assert!(max_x > 0.9 && max_x < 1.1);
    }

    #[test]
    fn frustum_accepts_box_in_front() {
        let projview = perspective_reversed_infinite(1., 1., 0.1)
            * look_at(Vector3::zeros(), Vector3::new(0., 0., -1.), Vector3::y());
        let obb = Obb::from_half_size(
            Vector3::new(0.5, 0.5, 0.5),
            &Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(0., 0., -5.),
                scale: 1.,
            },
        );
        assert!(frustum_intersects_obb(&projview, &obb));
    }

    #[test]
    fn frustum_rejects_box_behind_near_plane() {
        let projview = perspective_reversed_infinite(1., 1., 0.1)
            * look_at(Vector3::zeros(), Vector3::new(0., 0., -1.), Vector3::y());
        let obb = Obb::from_half_size(
            Vector3::new(0.5, 0.5, 0.5),
            &Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(0., 0., 5.),
                scale: 1.,
            },
        );
        assert!(!frustum_intersects_obb(&projview, &obb));
    }

    #[test]
    fn frustum_rejects_box_far_to_the_side() {
        let projview = perspective_reversed_infinite(1., 1., 0.1)
            * look_at(Vector3::zeros(), Vector3::new(0., 0., -1.), Vector3::y());
        let obb = Obb::from_half_size(
            Vector3::new(0.5, 0.5, 0.5),
            &Transform {
                rotation: UnitQuaternion::identity(),
                position: Vector3::new(100., 0., -5.),
                scale: 1.,
            },
        );
        assert!(!frustum_intersects_obb(&projview, &obb));
    }

    #[test]
    fn reversed_depth_limits() {
        let proj = perspective_reversed_infinite(1., 1., 0.1);
        let near = proj * Vector4::new(0., 0., -0.1, 1.);
        assert!((near.z / near.w - 1.).abs() < 1e-5);
        let far = proj * Vector4::new(0., 0., -1.0e6, 1.);
        assert!(far.z / far.w < 1e-3);
    }

    #[test]
    fn orthographic_reversed_depth_limits() {
        let proj = orthographic_reversed(-1., 1., -1., 1., 0.1, 10.);
        let near = proj * Vector4::new(0., 0., -0.1, 1.);
        assert!((near.z - 1.).abs() < 1e-5);
        let far = proj * Vector4::new(0., 0., -10., 1.);
        assert!(far.z.abs() < 1e-5);
    }

    #[test]
    fn pow2_rounds_down() {
        assert_eq!(nearest_pow2(1), 1);
        assert_eq!(nearest_pow2(2), 2);
        assert_eq!(nearest_pow2(640), 512);
        assert_eq!(nearest_pow2(1024), 1024);
    }
}
