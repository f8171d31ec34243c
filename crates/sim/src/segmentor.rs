//! A straightforward RANSAC plane segmentor over subsampled depth, standing
//! in for the organized segmentation of a real deployment.

use frame::{PlaneObservation, PlaneSegmentor, SegmentMethod, SegmentSource};
use geometry::Plane;
use nalgebra::{Matrix3, Point3, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct GridSegmentor {
    /// Sample every n-th pixel in both directions.
    pub step: u32,
    pub iterations: usize,
    pub distance_threshold: f64,
    pub min_inliers: usize,
    pub max_planes: usize,
    pub seed: u64,
}

impl Default for GridSegmentor {
    fn default() -> Self {
        Self {
            step: 4,
            iterations: 120,
            distance_threshold: 0.03,
            min_inliers: 40,
            max_planes: 5,
            seed: 17,
        }
    }
}

impl PlaneSegmentor for GridSegmentor {
    fn segment(&self, source: &SegmentSource<'_>) -> Vec<PlaneObservation> {
        let samples: Vec<(usize, Point3<f64>)> = match source {
            SegmentSource::Cloud(cloud) => cloud
                .points
                .iter()
                .enumerate()
                .filter_map(|(i, p)| p.map(|p| (i, p)))
                .collect(),
            SegmentSource::Depth { depth, intrinsics } => {
                let mut pts = Vec::new();
                let mut v = 0;
                while v < depth.height {
                    let mut u = 0;
                    while u < depth.width {
                        let d = depth.at(u, v) as f64;
                        if let Some(p) = intrinsics.back_project(u as f64, v as f64, d) {
                            pts.push(((v * depth.width + u) as usize, p));
                        }
                        u += self.step;
                    }
                    v += self.step;
                }
                pts
            }
        };

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut remaining = samples;
        let mut planes = Vec::new();

        while planes.len() < self.max_planes && remaining.len() >= self.min_inliers {
            let Some(observation) = self.extract_one(&mut rng, &mut remaining) else {
                break;
            };
            planes.push(observation);
        }
        planes
    }

    fn method(&self) -> SegmentMethod {
        SegmentMethod::Organized
    }
}

impl GridSegmentor {
    fn extract_one(
        &self,
        rng: &mut StdRng,
        remaining: &mut Vec<(usize, Point3<f64>)>,
    ) -> Option<PlaneObservation> {
        let n = remaining.len();
        let mut best_inliers: Vec<usize> = Vec::new();

        for _ in 0..self.iterations {
            let (a, b, c) = (
                rng.gen_range(0..n),
                rng.gen_range(0..n),
                rng.gen_range(0..n),
            );
            if a == b || b == c || a == c {
                continue;
            }
            let (pa, pb, pc) = (remaining[a].1, remaining[b].1, remaining[c].1);
            let normal = (pb - pa).cross(&(pc - pa));
            if normal.norm() < 1e-6 {
                continue;
            }
            let candidate = Plane::from_point_normal(&pa, normal);
            let inliers: Vec<usize> = (0..n)
                .filter(|&i| candidate.distance_to_point(&remaining[i].1) < self.distance_threshold)
                .collect();
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
            }
        }
        if best_inliers.len() < self.min_inliers {
            return None;
        }

        // Least-squares refit over the consensus set.
        let points: Vec<Point3<f64>> = best_inliers.iter().map(|&i| remaining[i].1).collect();
        let plane = fit_plane(&points)?;
        let inliers: Vec<usize> = (0..remaining.len())
            .filter(|&i| plane.distance_to_point(&remaining[i].1) < self.distance_threshold)
            .collect();
        if inliers.len() < self.min_inliers {
            return None;
        }

        let points: Vec<Point3<f64>> = inliers.iter().map(|&i| remaining[i].1).collect();
        let centroid = Point3::from(
            points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64,
        );
        let hull = bounding_hull(&plane, &centroid, &points);
        let pixel_indices: Vec<usize> = inliers.iter().map(|&i| remaining[i].0).collect();

        let inlier_set: std::collections::BTreeSet<usize> = inliers.into_iter().collect();
        let mut keep = Vec::with_capacity(remaining.len() - inlier_set.len());
        for (i, entry) in remaining.drain(..).enumerate() {
            if !inlier_set.contains(&i) {
                keep.push(entry);
            }
        }
        *remaining = keep;

        Some(PlaneObservation {
            plane,
            inliers: pixel_indices,
            centroid,
            hull,
        })
    }
}

/// Total least-squares plane through a point set: centroid + the covariance
/// eigenvector of the smallest eigenvalue.
fn fit_plane(points: &[Point3<f64>]) -> Option<Plane> {
    if points.len() < 3 {
        return None;
    }
    let centroid = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64;
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }
    let eigen = cov.symmetric_eigen();
    let mut min_idx = 0;
    for i in 1..3 {
        if eigen.eigenvalues[i] < eigen.eigenvalues[min_idx] {
            min_idx = i;
        }
    }
    let normal = eigen.eigenvectors.column(min_idx).into_owned();
    if normal.norm() < 1e-9 {
        return None;
    }
    Some(Plane::from_point_normal(&Point3::from(centroid), normal))
}

/// Rectangle corners of the observed extent in the plane's own basis.
fn bounding_hull(plane: &Plane, centroid: &Point3<f64>, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
    let n = plane.normal().into_inner();
    let seed = if n.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    let u = n.cross(&seed).normalize();
    let v = n.cross(&u);

    let (mut min_u, mut max_u) = (f64::MAX, f64::MIN);
    let (mut min_v, mut max_v) = (f64::MAX, f64::MIN);
    for p in points {
        let d = p - centroid;
        let pu = d.dot(&u);
        let pv = d.dot(&v);
        min_u = min_u.min(pu);
        max_u = max_u.max(pu);
        min_v = min_v.min(pv);
        max_v = max_v.max(pv);
    }
    vec![
        centroid + u * min_u + v * min_v,
        centroid + u * max_u + v * min_v,
        centroid + u * max_u + v * max_v,
        centroid + u * min_u + v * max_v,
    ]
}
