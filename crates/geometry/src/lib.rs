//! 3D rigid transforms and plane algebra.
//!
//! Conventions:
//! - All poses are expressed in the `map` frame unless stated otherwise.
//! - A `Transform3D` from frame B to frame A maps B-frame coordinates into
//!   A-frame coordinates: `p_a = T_ab * p_b`.
//! - Planes are kept in Hessian normal form `a*x + b*y + c*z + d = 0` with
//!   a unit normal and a canonical sign (`d >= 0`).

use nalgebra::{
    Isometry3, Point3, Translation3, Unit, UnitQuaternion, Vector3,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use types::PoseRecord;

/// A 3D rigid body transform (rotation + translation).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Transform3D {
    inner: Isometry3<f64>,
}

impl Transform3D {
    /// Create identity transform.
    pub fn identity() -> Self {
        Self {
            inner: Isometry3::identity(),
        }
    }

    /// Create from translation and rotation.
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            inner: Isometry3::from_parts(Translation3::from(translation), rotation),
        }
    }

    /// Create from translation and roll/pitch/yaw Euler angles.
    pub fn from_xyz_rpy(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self::new(
            Vector3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    /// Create from nalgebra Isometry3.
    pub fn from_isometry(iso: Isometry3<f64>) -> Self {
        Self { inner: iso }
    }

    /// Get the underlying nalgebra Isometry3.
    pub fn as_isometry(&self) -> &Isometry3<f64> {
        &self.inner
    }

    /// Get translation component.
    pub fn translation(&self) -> Vector3<f64> {
        self.inner.translation.vector
    }

    /// Get rotation component.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.inner.rotation
    }

    /// Magnitude of the rotation in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.inner.rotation.angle()
    }

    /// Compute inverse transform.
    pub fn inverse(&self) -> Self {
        Self {
            inner: self.inner.inverse(),
        }
    }

    /// Compose transforms: self * other.
    /// If self is B->A and other is C->B, result is C->A.
    pub fn compose(&self, other: &Transform3D) -> Transform3D {
        Transform3D {
            inner: self.inner * other.inner,
        }
    }

    /// Compute relative transform from self to other:
    /// both expressed in the same frame, returns self^-1 * other.
    pub fn relative_to(&self, other: &Transform3D) -> Transform3D {
        Transform3D {
            inner: self.inner.inverse() * other.inner,
        }
    }

    /// Transform a point from child frame to parent frame.
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.inner.transform_point(point)
    }

    /// Rotate a vector (no translation applied).
    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.inner.rotation * v
    }

    /// Roll/pitch/yaw of the rotation part.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.inner.rotation.euler_angles()
    }

    /// Project onto the ground plane: (x, y, yaw). Used for the map<-odom
    /// broadcast so the correction composes with a 2D odometry chain.
    pub fn to_planar(&self) -> PlanarTransform {
        let t = self.translation();
        let (_, _, yaw) = self.euler_angles();
        PlanarTransform { x: t.x, y: t.y, yaw }
    }

    /// Serialize as a path record: translation + quaternion (xyzw).
    pub fn to_pose_record(&self) -> PoseRecord {
        let t = self.translation();
        let q = self.inner.rotation.quaternion();
        PoseRecord {
            tx: t.x,
            ty: t.y,
            tz: t.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
        }
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation().iter().all(|v| v.is_finite())
            && self.inner.rotation.quaternion().coords.iter().all(|v| v.is_finite())
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: Transform3D) -> Transform3D {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Transform3D> for Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: &Transform3D) -> Transform3D {
        self.compose(rhs)
    }
}

impl std::ops::Mul<Transform3D> for &Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: Transform3D) -> Transform3D {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Transform3D> for &Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: &Transform3D) -> Transform3D {
        self.compose(rhs)
    }
}

/// Planar (x, y, yaw) transform, the shape broadcast as map<-odom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanarTransform {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

/// An infinite plane in Hessian normal form: `n . p + d = 0` with |n| = 1.
///
/// The stored representation is canonical: the sign is flipped so that
/// `d >= 0` after every normalization step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Plane {
    normal: Unit<Vector3<f64>>,
    d: f64,
}

impl Plane {
    /// Build from an (unnormalized) normal and offset.
    pub fn new(normal: Vector3<f64>, d: f64) -> Self {
        let norm = normal.norm();
        let mut n = normal / norm;
        let mut d = d / norm;
        if d < 0.0 {
            n = -n;
            d = -d;
        }
        Self {
            normal: Unit::new_unchecked(n),
            d,
        }
    }

    /// Build from raw coefficients (a, b, c, d).
    pub fn from_coefficients(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self::new(Vector3::new(a, b, c), d)
    }

    /// Plane through a point with the given normal direction.
    pub fn from_point_normal(point: &Point3<f64>, normal: Vector3<f64>) -> Self {
        let n = normal.normalize();
        Self::new(n, -n.dot(&point.coords))
    }

    pub fn normal(&self) -> Unit<Vector3<f64>> {
        self.normal
    }

    pub fn d(&self) -> f64 {
        self.d
    }

    /// Coefficients (a, b, c, d).
    pub fn coefficients(&self) -> [f64; 4] {
        [self.normal.x, self.normal.y, self.normal.z, self.d]
    }

    /// Transform rule under T = (R, t): n' = R n, d' = d - n' . t.
    ///
    /// If the plane is expressed in frame B and T maps B-frame coordinates
    /// into A-frame coordinates, the result is the plane in frame A.
    pub fn transformed(&self, t: &Transform3D) -> Plane {
        let n = t.transform_vector(&self.normal);
        let d = self.d - n.dot(&t.translation());
        Plane::new(n, d)
    }

    /// Signed distance from a point to the plane.
    pub fn signed_distance(&self, p: &Point3<f64>) -> f64 {
        self.normal.dot(&p.coords) + self.d
    }

    /// Absolute distance from a point to the plane.
    pub fn distance_to_point(&self, p: &Point3<f64>) -> f64 {
        self.signed_distance(p).abs()
    }

    /// Angle between the oriented normals of two planes, in [0, PI].
    pub fn angle_to(&self, other: &Plane) -> f64 {
        self.normal.dot(&other.normal).clamp(-1.0, 1.0).acos()
    }

    /// Angular and positional separation: (normal angle, |d1 - d2|).
    ///
    /// This is the metric used for plane correspondence search and for the
    /// plane-alignment RMSE.
    pub fn separation(&self, other: &Plane) -> (f64, f64) {
        (self.angle_to(other), (self.d - other.d).abs())
    }
}

/// Normalize angle to [-PI, PI).
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a >= PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Shortest angular difference from a to b.
pub fn angle_diff(a: f64, b: f64) -> f64 {
    normalize_angle(b - a)
}
