//! Closed-form rigid alignment from points, planes, or mixed constraints.
//!
//! All solvers estimate the transform T mapping "from"-frame coordinates
//! into "to"-frame coordinates. The tracker calls them with
//! from = current frame, to = last frame, so the result is the relative
//! pose of the current frame with respect to the last one.

use geometry::{Plane, Transform3D};
use nalgebra::{DMatrix, DVector, Matrix3, Point3, Rotation3, UnitQuaternion, Vector3};

/// Minimum pairwise normal angle for a plane triple to be well-conditioned.
const MIN_PAIR_ANGLE_RAD: f64 = 15.0 * std::f64::consts::PI / 180.0;

/// Outcome of a motion solver: explicit validity plus metrics, never an
/// exception or a sentinel transform.
#[derive(Debug, Clone)]
pub struct MotionEstimate {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub inliers: usize,
    pub rmse: f64,
    pub valid: bool,
}

impl MotionEstimate {
    pub fn invalid() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            inliers: 0,
            rmse: 1e9,
            valid: false,
        }
    }

    pub fn from_transform(t: &Transform3D, inliers: usize, rmse: f64) -> Self {
        Self {
            rotation: t.rotation(),
            translation: t.translation(),
            inliers,
            rmse,
            valid: true,
        }
    }

    pub fn to_transform(&self) -> Transform3D {
        Transform3D::new(self.translation, self.rotation)
    }

    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.quaternion().coords.iter().all(|v| v.is_finite())
    }
}

/// Umeyama rotation from a 3x3 covariance, scale disabled.
///
/// S' = diag(1, 1, sign(det U * det V)); the rank-2 case falls back to
/// plain U V^T when the determinant product is already positive.
fn rotation_from_covariance(sigma: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    let det_sigma = sigma.determinant();
    let svd = sigma.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut s = Vector3::new(1.0, 1.0, 1.0);
    if det_sigma < 0.0 {
        s[2] = -1.0;
    }

    let sv = &svd.singular_values;
    let rank = sv.iter().filter(|&&x| x > sv[0] * 1e-12).count();
    let det_uv = u.determinant() * v_t.determinant();

    let r = if rank == 2 {
        if det_uv > 0.0 {
            u * v_t
        } else {
            let s2 = Vector3::new(1.0, 1.0, -1.0);
            u * Matrix3::from_diagonal(&s2) * v_t
        }
    } else {
        u * Matrix3::from_diagonal(&s) * v_t
    };

    if !r.iter().all(|x| x.is_finite()) {
        return None;
    }
    Some(Rotation3::from_matrix_unchecked(r))
}

/// Rigid alignment from >= 3 point pairs (Umeyama, scale disabled).
pub fn solve_rt_points(from: &[Point3<f64>], to: &[Point3<f64>]) -> MotionEstimate {
    let n = from.len();
    if n < 3 || n != to.len() {
        return MotionEstimate::invalid();
    }
    let inv_n = 1.0 / n as f64;

    let mut from_mean = Vector3::zeros();
    let mut to_mean = Vector3::zeros();
    for (f, t) in from.iter().zip(to.iter()) {
        from_mean += f.coords;
        to_mean += t.coords;
    }
    from_mean *= inv_n;
    to_mean *= inv_n;

    let mut sigma = Matrix3::zeros();
    for (f, t) in from.iter().zip(to.iter()) {
        sigma += (t.coords - to_mean) * (f.coords - from_mean).transpose();
    }
    sigma *= inv_n;

    let Some(r) = rotation_from_covariance(&sigma) else {
        return MotionEstimate::invalid();
    };
    let t = to_mean - r * from_mean;
    if !t.iter().all(|v| v.is_finite()) {
        return MotionEstimate::invalid();
    }

    let mut sq = 0.0;
    for (f, p) in from.iter().zip(to.iter()) {
        let pred = r * f.coords + t;
        sq += (p.coords - pred).norm_squared();
    }

    MotionEstimate {
        rotation: UnitQuaternion::from_rotation_matrix(&r),
        translation: t,
        inliers: n,
        rmse: (sq * inv_n).sqrt(),
        valid: true,
    }
}

/// Rigid alignment from exactly three plane pairs.
///
/// Rejects degenerate triples where any two normals are closer than 15
/// degrees in either frame. Rotation from the normal covariance; translation
/// from the 3x3 linear system `n_to^T t = d_from - d_to` solved by SVD.
pub fn solve_rt_planes(from: &[Plane], to: &[Plane]) -> MotionEstimate {
    if from.len() != 3 || to.len() != 3 {
        return MotionEstimate::invalid();
    }
    for set in [from, to] {
        for i in 0..2 {
            for j in (i + 1)..3 {
                if set[i].angle_to(&set[j]) < MIN_PAIR_ANGLE_RAD {
                    return MotionEstimate::invalid();
                }
            }
        }
    }

    let mut sigma = Matrix3::zeros();
    for (f, t) in from.iter().zip(to.iter()) {
        sigma += t.normal().into_inner() * f.normal().into_inner().transpose();
    }
    let Some(r) = rotation_from_covariance(&sigma) else {
        return MotionEstimate::invalid();
    };

    let a = DMatrix::from_fn(3, 3, |i, j| to[i].normal()[j]);
    let b = DVector::from_fn(3, |i, _| from[i].d() - to[i].d());
    let Some(t) = least_squares(a, b) else {
        return MotionEstimate::invalid();
    };

    let rotation = UnitQuaternion::from_rotation_matrix(&r);
    let transform = Transform3D::new(t, rotation);

    // Score by plane residual: RMS of angular plus positional separation.
    let mut dir_sq = 0.0;
    let mut dis_sq = 0.0;
    for (f, p) in from.iter().zip(to.iter()) {
        let (dir, dis) = f.transformed(&transform).separation(p);
        dir_sq += dir * dir;
        dis_sq += dis * dis;
    }
    let rmse = (dir_sq / 3.0).sqrt() + (dis_sq / 3.0).sqrt();

    MotionEstimate {
        rotation,
        translation: t,
        inliers: 3,
        rmse,
        valid: true,
    }
}

/// Mixed plane+point alignment from exactly three constraints
/// (`num_planes + num_points == 3`).
///
/// Rotation from the sum of the point covariance (weighted 1/n) and the
/// plane normal covariance (weighted 1). Translation from the stacked
/// linear system combining point equations `n * I3 * t = n * (mean_to - R mean_from)`
/// and plane equations `n_to_i^T t = d_from_i - d_to_i`, least squares.
pub fn solve_rt_mixed(
    from_planes: &[Plane],
    to_planes: &[Plane],
    from_points: &[Point3<f64>],
    to_points: &[Point3<f64>],
) -> MotionEstimate {
    let np = from_points.len();
    let npl = from_planes.len();
    if np != to_points.len() || npl != to_planes.len() || np + npl != 3 || npl == 0 {
        return MotionEstimate::invalid();
    }

    let mut from_mean = Vector3::zeros();
    let mut to_mean = Vector3::zeros();
    let mut sigma = Matrix3::zeros();
    if np > 0 {
        let inv_n = 1.0 / np as f64;
        for (f, t) in from_points.iter().zip(to_points.iter()) {
            from_mean += f.coords;
            to_mean += t.coords;
        }
        from_mean *= inv_n;
        to_mean *= inv_n;
        for (f, t) in from_points.iter().zip(to_points.iter()) {
            sigma += inv_n * (t.coords - to_mean) * (f.coords - from_mean).transpose();
        }
    }
    for (f, t) in from_planes.iter().zip(to_planes.iter()) {
        sigma += t.normal().into_inner() * f.normal().into_inner().transpose();
    }

    let Some(r) = rotation_from_covariance(&sigma) else {
        return MotionEstimate::invalid();
    };

    let rows = if np > 0 { 3 + npl } else { npl };
    let mut a = DMatrix::zeros(rows, 3);
    let mut b = DVector::zeros(rows);
    let mut row = 0;
    if np > 0 {
        let w = np as f64;
        let rhs = w * (to_mean - r * from_mean);
        for i in 0..3 {
            a[(row, i)] = w;
            // off-diagonal entries of w*I3 stay zero
            b[row] = rhs[i];
            row += 1;
        }
    }
    for (f, t) in from_planes.iter().zip(to_planes.iter()) {
        for j in 0..3 {
            a[(row, j)] = t.normal()[j];
        }
        b[row] = f.d() - t.d();
        row += 1;
    }

    let Some(t) = least_squares(a, b) else {
        return MotionEstimate::invalid();
    };

    MotionEstimate {
        rotation: UnitQuaternion::from_rotation_matrix(&r),
        translation: t,
        inliers: 3,
        rmse: 0.0,
        valid: true,
    }
}

fn least_squares(a: DMatrix<f64>, b: DVector<f64>) -> Option<Vector3<f64>> {
    let svd = a.svd(true, true);
    let x = svd.solve(&b, 1e-12).ok()?;
    let t = Vector3::new(x[0], x[1], x[2]);
    t.iter().all(|v| v.is_finite()).then_some(t)
}
