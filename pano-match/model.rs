//! Geometric models relating pixels of image A to pixels of image B.
//!
//! Homographies are estimated by DLT with Hartley normalization. Rotation models turn
//! pixels into rays through each image's [`CameraModel`] and solve for the rotation
//! with Kabsch; the `rpyv` and `rpyvb` variants additionally search a shared focal
//! length scale and a shared radial distortion term.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, Matrix3, Rotation3, SymmetricEigen, Vector3};
use pano_core::CameraModel;

use crate::error::{MatchError, MatchResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const GOLDEN_ITERATIONS: usize = 24;
const FOCAL_SCALE_RANGE: (f64, f64) = (0.5, 2.0);
const DISTORTION_B_RANGE: (f64, f64) = (-0.15, 0.15);

/// Concrete model family fitted by RANSAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ModelKind {
    /// General plane-to-plane homography, 8 DOF
    Homography,
    /// Rotation only: roll, pitch, yaw
    Rpy,
    /// Rotation and a shared field of view scale
    Rpyv,
    /// Rotation, field of view and the `b` distortion term
    Rpyvb,
}

impl ModelKind {
    /// Minimal number of correspondences
    pub fn sample_size(&self) -> usize {
        match self {
            ModelKind::Homography => 4,
            ModelKind::Rpy => 2,
            ModelKind::Rpyv => 3,
            ModelKind::Rpyvb => 4,
        }
    }
}

/// RANSAC model choice; `Auto` defers to a `ModelSelector` per pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RansacMode {
    #[default]
    Auto,
    #[cfg_attr(feature = "serde", serde(alias = "hom"))]
    Homography,
    Rpy,
    Rpyv,
    Rpyvb,
}

impl RansacMode {
    pub fn fixed(&self) -> Option<ModelKind> {
        match self {
            RansacMode::Auto => None,
            RansacMode::Homography => Some(ModelKind::Homography),
            RansacMode::Rpy => Some(ModelKind::Rpy),
            RansacMode::Rpyv => Some(ModelKind::Rpyv),
            RansacMode::Rpyvb => Some(ModelKind::Rpyvb),
        }
    }
}

impl FromStr for RansacMode {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RansacMode::Auto),
            "hom" | "homography" => Ok(RansacMode::Homography),
            "rpy" => Ok(RansacMode::Rpy),
            "rpyv" => Ok(RansacMode::Rpyv),
            "rpyvb" => Ok(RansacMode::Rpyvb),
            other => Err(MatchError::UnknownRansacMode(other.to_string())),
        }
    }
}

impl fmt::Display for RansacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RansacMode::Auto => "auto",
            RansacMode::Homography => "hom",
            RansacMode::Rpy => "rpy",
            RansacMode::Rpyv => "rpyv",
            RansacMode::Rpyvb => "rpyvb",
        };
        f.write_str(name)
    }
}

/// Fitted relation between the two images of a pair
#[derive(Debug, Clone)]
pub enum GeometricModel {
    Homography(Matrix3<f64>),
    Rotation {
        /// Maps rays of camera A onto rays of camera B
        rotation: Rotation3<f64>,
        camera_a: CameraModel,
        camera_b: CameraModel,
    },
}

impl GeometricModel {
    /// Where pixel `(x, y)` of image A lands in image B
    pub fn transfer(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        match self {
            GeometricModel::Homography(h) => project(h, x, y),
            GeometricModel::Rotation {
                rotation,
                camera_a,
                camera_b,
            } => {
                let ray = camera_a.pixel_to_ray(x, y)?;
                camera_b.ray_to_pixel(&(rotation * ray))
            }
        }
    }

    /// Transfer error in image B pixels, infinite when the point cannot be transferred
    pub fn transfer_error(&self, a: [f64; 2], b: [f64; 2]) -> f64 {
        match self.transfer(a[0], a[1]) {
            Some((x, y)) => ((x - b[0]).powi(2) + (y - b[1]).powi(2)).sqrt(),
            None => f64::INFINITY,
        }
    }
}

/// Project a 2D point through a homography
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return None;
    }
    Some((p[0] / p[2], p[1] / p[2]))
}

/// Translate the centroid to the origin and scale to mean distance sqrt(2)
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

/// Homography `H` with `dst ~ H * src`, from at least four correspondences
pub fn fit_homography(src: &[[f64; 2]], dst: &[[f64; 2]]) -> MatchResult<Matrix3<f64>> {
    let n = src.len().min(dst.len());
    if n < 4 {
        return Err(MatchError::TooFewPoints { needed: 4, got: n });
    }

    let (t_src, src_n) = normalize_points(&src[..n]);
    let (t_dst, dst_n) = normalize_points(&dst[..n]);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of A^T A with the smallest eigenvalue
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig.eigenvalues.iamin();
    let h = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| MatchError::NumericalFailure("normalization not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        return Err(MatchError::NumericalFailure("homography at infinity".into()));
    }
    Ok(h / scale)
}

/// Rotation `R` minimizing `sum |b_i - R a_i|^2`
pub fn kabsch(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> Option<Rotation3<f64>> {
    if a.len() < 2 || a.len() != b.len() {
        return None;
    }
    let mut h = Matrix3::zeros();
    for (p, q) in a.iter().zip(b.iter()) {
        h += p * q.transpose();
    }
    let svd = h.svd(true, true);
    // Two independent directions are needed
    if svd.singular_values.iter().filter(|s| **s > 1e-12).count() < 2 {
        return None;
    }
    let smallest = svd.singular_values.imin();
    let u = svd.u?;
    let v = svd.v_t?.transpose();
    let mut diagonal = Vector3::new(1.0, 1.0, 1.0);
    diagonal[smallest] = (v * u.transpose()).determinant().signum();
    let correction = Matrix3::from_diagonal(&diagonal);
    Some(Rotation3::from_matrix_unchecked(v * correction * u.transpose()))
}

/// True when three of the points span (almost) no area
fn has_collinear_triple(pts: &[[f64; 2]]) -> bool {
    let n = pts.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let (p, q, r) = (pts[i], pts[j], pts[k]);
                let cross = (q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0]);
                if cross.abs() < 1.0 {
                    return true;
                }
            }
        }
    }
    false
}

fn rays(camera: &CameraModel, pts: &[[f64; 2]]) -> Option<Vec<Vector3<f64>>> {
    pts.iter().map(|p| camera.pixel_to_ray(p[0], p[1])).collect()
}

/// Minimize a unimodal function on `[lo, hi]`
fn golden_section<F: Fn(f64) -> f64>(mut lo: f64, mut hi: f64, f: F) -> f64 {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = hi - ratio * (hi - lo);
    let mut d = lo + ratio * (hi - lo);
    let mut fc = f(c);
    let mut fd = f(d);
    for _ in 0..GOLDEN_ITERATIONS {
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - ratio * (hi - lo);
            fc = f(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + ratio * (hi - lo);
            fd = f(d);
        }
    }
    (lo + hi) / 2.0
}

/// Fits one model family for a given pair of cameras
#[derive(Debug, Clone)]
pub struct ModelFitter {
    kind: ModelKind,
    camera_a: CameraModel,
    camera_b: CameraModel,
}

impl ModelFitter {
    pub fn new(kind: ModelKind, camera_a: CameraModel, camera_b: CameraModel) -> Self {
        Self {
            kind,
            camera_a,
            camera_b,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn sample_size(&self) -> usize {
        self.kind.sample_size()
    }

    /// Fit from `a[i] <-> b[i]`; `None` for degenerate input
    pub fn fit(&self, a: &[[f64; 2]], b: &[[f64; 2]]) -> Option<GeometricModel> {
        if a.len() < self.sample_size() || a.len() != b.len() {
            return None;
        }
        match self.kind {
            ModelKind::Homography => {
                if a.len() == 4 && (has_collinear_triple(a) || has_collinear_triple(b)) {
                    return None;
                }
                fit_homography(a, b).ok().map(GeometricModel::Homography)
            }
            ModelKind::Rpy => self.fit_rotation(1.0, None, a, b).map(|(m, _)| m),
            ModelKind::Rpyv => {
                let k = self.search_focal_scale(None, a, b);
                self.fit_rotation(k, None, a, b).map(|(m, _)| m)
            }
            ModelKind::Rpyvb => {
                let mut k = 1.0;
                let mut dist_b = self.camera_a.distortion()[1];
                for _ in 0..2 {
                    k = self.search_focal_scale(Some(dist_b), a, b);
                    dist_b = golden_section(DISTORTION_B_RANGE.0, DISTORTION_B_RANGE.1, |v| {
                        self.residual(k, Some(v), a, b)
                    });
                }
                self.fit_rotation(k, Some(dist_b), a, b).map(|(m, _)| m)
            }
        }
    }

    fn search_focal_scale(&self, dist_b: Option<f64>, a: &[[f64; 2]], b: &[[f64; 2]]) -> f64 {
        let (lo, hi) = (FOCAL_SCALE_RANGE.0.ln(), FOCAL_SCALE_RANGE.1.ln());
        golden_section(lo, hi, |log_k| self.residual(log_k.exp(), dist_b, a, b)).exp()
    }

    fn residual(&self, k: f64, dist_b: Option<f64>, a: &[[f64; 2]], b: &[[f64; 2]]) -> f64 {
        self.fit_rotation(k, dist_b, a, b).map(|(_, r)| r).unwrap_or(f64::INFINITY)
    }

    fn cameras(&self, k: f64, dist_b: Option<f64>) -> (CameraModel, CameraModel) {
        let mut cam_a = self.camera_a.with_focal_scale(k);
        let mut cam_b = self.camera_b.with_focal_scale(k);
        if let Some(v) = dist_b {
            cam_a = cam_a.with_distortion_b(v);
            cam_b = cam_b.with_distortion_b(v);
        }
        (cam_a, cam_b)
    }

    fn fit_rotation(
        &self,
        k: f64,
        dist_b: Option<f64>,
        a: &[[f64; 2]],
        b: &[[f64; 2]],
    ) -> Option<(GeometricModel, f64)> {
        let (camera_a, camera_b) = self.cameras(k, dist_b);
        let ra = rays(&camera_a, a)?;
        let rb = rays(&camera_b, b)?;
        let rotation = kabsch(&ra, &rb)?;
        let residual = ra
            .iter()
            .zip(rb.iter())
            .map(|(p, q)| (q - rotation * p).norm_squared())
            .sum();
        Some((
            GeometricModel::Rotation {
                rotation,
                camera_a,
                camera_b,
            },
            residual,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pano_core::{Pose, Projection};

    fn camera(hfov: f64) -> CameraModel {
        CameraModel::from_parts(1000.0, 800.0, hfov, Projection::Rectilinear, [0.0; 3])
    }

    /// Pixels of A and their images in B under relative rotation `r` with shared cameras
    fn rotated_pairs(cam_a: &CameraModel, cam_b: &CameraModel, r: &Rotation3<f64>) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let mut a = Vec::new();
        let mut b = Vec::new();
        for &(x, y) in &[(620.0, 100.0), (900.0, 400.0), (700.0, 700.0), (850.0, 250.0), (760.0, 520.0), (950.0, 650.0)] {
            let ray = cam_a.pixel_to_ray(x, y).unwrap();
            if let Some((u, v)) = cam_b.ray_to_pixel(&(r * ray)) {
                a.push([x, y]);
                b.push([u, v]);
            }
        }
        (a, b)
    }

    #[test]
    fn test_homography_recovers_ground_truth() {
        let truth = Matrix3::new(1.02, 0.03, -700.0, -0.01, 0.98, 12.0, 1e-5, -2e-5, 1.0);
        let src = vec![[710.0, 30.0], [980.0, 60.0], [760.0, 770.0], [990.0, 700.0], [850.0, 400.0]];
        let dst: Vec<[f64; 2]> = src.iter().map(|p| {
            let (x, y) = project(&truth, p[0], p[1]).unwrap();
            [x, y]
        }).collect();
        let h = fit_homography(&src, &dst).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(h[(i, j)], truth[(i, j)], epsilon = 1e-6 * truth[(i, j)].abs().max(1.0));
            }
        }
        assert!(matches!(fit_homography(&src[..3], &dst[..3]), Err(MatchError::TooFewPoints { .. })));
    }

    #[test]
    fn test_kabsch_recovers_rotation() {
        let r = Pose::new(20.0, -5.0, 3.0).rotation();
        let a = vec![Vector3::new(0.1, 0.2, 1.0).normalize(), Vector3::new(-0.3, 0.1, 1.0).normalize(), Vector3::new(0.0, -0.4, 1.0).normalize()];
        let b: Vec<Vector3<f64>> = a.iter().map(|p| r * p).collect();
        let est = kabsch(&a, &b).unwrap();
        assert_abs_diff_eq!(est.angle_to(&r), 0.0, epsilon = 1e-9);

        let parallel = vec![Vector3::z(), Vector3::z()];
        assert!(kabsch(&parallel, &parallel).is_none());
    }

    #[test]
    fn test_rpy_fit_transfers_points() {
        let cam = camera(60.0);
        let r = Pose::new(30.0, 2.0, 1.0).rotation().inverse();
        let (a, b) = rotated_pairs(&cam, &cam, &r);
        assert!(a.len() >= 4);
        let fitter = ModelFitter::new(ModelKind::Rpy, cam.clone(), cam.clone());
        let model = fitter.fit(&a[..2], &b[..2]).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert!(model.transfer_error(*p, *q) < 1e-6);
        }
    }

    #[test]
    fn test_rpyv_recovers_focal_scale() {
        // True cameras are 10% longer than the metadata claims
        let believed = camera(60.0);
        let truth = believed.with_focal_scale(1.1);
        let r = Pose::new(25.0, 0.0, 0.0).rotation().inverse();
        let (a, b) = rotated_pairs(&truth, &truth, &r);
        let fitter = ModelFitter::new(ModelKind::Rpyv, believed.clone(), believed);
        let model = fitter.fit(&a, &b).unwrap();
        match &model {
            GeometricModel::Rotation { camera_a, .. } => {
                assert_abs_diff_eq!(camera_a.focal(), truth.focal(), epsilon = truth.focal() * 1e-3);
            }
            other => panic!("unexpected model {:?}", other),
        }
        for (p, q) in a.iter().zip(b.iter()) {
            assert!(model.transfer_error(*p, *q) < 0.5);
        }
    }

    #[test]
    fn test_ransac_mode_parsing() {
        assert_eq!("hom".parse::<RansacMode>().unwrap(), RansacMode::Homography);
        assert_eq!("RPYVB".parse::<RansacMode>().unwrap(), RansacMode::Rpyvb);
        assert!(matches!("affine".parse::<RansacMode>(), Err(MatchError::UnknownRansacMode(_))));
        assert_eq!(RansacMode::Rpyv.to_string(), "rpyv");
        assert_eq!(RansacMode::Auto.fixed(), None);
        assert_eq!(RansacMode::Rpy.fixed().map(|k| k.sample_size()), Some(2));
    }
}
