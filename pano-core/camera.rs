//! Pixel/ray conversion for the supported projections.
//!
//! Camera frame: `x` right, `y` down, `z` forward. World rays are obtained with
//! `pose.rotation() * camera_ray`.

use crate::{ImageInfo, Projection};
use nalgebra::{Rotation3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

/// Camera orientation in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Pose {
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Camera-to-world rotation `Ry(yaw) * Rx(pitch) * Rz(roll)`
    pub fn rotation(&self) -> Rotation3<f64> {
        let yaw = Rotation3::from_axis_angle(&Vector3::y_axis(), self.yaw.to_radians());
        let pitch = Rotation3::from_axis_angle(&Vector3::x_axis(), self.pitch.to_radians());
        let roll = Rotation3::from_axis_angle(&Vector3::z_axis(), self.roll.to_radians());
        yaw * pitch * roll
    }

    /// Inverse of [`Pose::rotation`]
    pub fn from_rotation(r: &Rotation3<f64>) -> Self {
        let m = r.matrix();
        let pitch = (-m[(1, 2)]).clamp(-1.0, 1.0).asin();
        let yaw = m[(0, 2)].atan2(m[(2, 2)]);
        let roll = m[(1, 0)].atan2(m[(1, 1)]);
        Self {
            yaw: yaw.to_degrees(),
            pitch: pitch.to_degrees(),
            roll: roll.to_degrees(),
        }
    }
}

/// Geometric model of one image: projection, focal length in pixels and radial
/// distortion.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    width: f64,
    height: f64,
    cx: f64,
    cy: f64,
    hfov: f64,
    focal: f64,
    projection: Projection,
    distortion: [f64; 3],
    /// Radius used to normalize distortion, half the shorter side
    norm: f64,
}

impl CameraModel {
    pub fn new(info: &ImageInfo) -> Self {
        Self::from_parts(
            info.width as f64,
            info.height as f64,
            info.hfov,
            info.projection,
            info.distortion,
        )
    }

    pub fn from_parts(width: f64, height: f64, hfov: f64, projection: Projection, distortion: [f64; 3]) -> Self {
        Self {
            width,
            height,
            cx: width / 2.0,
            cy: height / 2.0,
            hfov,
            focal: focal_from_hfov(width, hfov, projection),
            projection,
            distortion,
            norm: width.min(height) / 2.0,
        }
    }

    /// Same camera with its horizontal field of view multiplied by `k`
    pub fn with_hfov_scale(&self, k: f64) -> Self {
        let hfov = (self.hfov * k).min(max_hfov(self.projection));
        Self {
            hfov,
            focal: focal_from_hfov(self.width, hfov, self.projection),
            ..self.clone()
        }
    }

    /// Same camera with its focal length multiplied by `k`
    pub fn with_focal_scale(&self, k: f64) -> Self {
        let focal = self.focal * k;
        Self {
            focal,
            hfov: hfov_from_focal(self.width, focal, self.projection),
            ..self.clone()
        }
    }

    /// Same camera with the `b` distortion coefficient replaced
    pub fn with_distortion_b(&self, b: f64) -> Self {
        let mut distortion = self.distortion;
        distortion[1] = b;
        Self { distortion, ..self.clone() }
    }

    /// Same geometry, different projection; focal length in pixels is kept
    pub fn with_projection(&self, projection: Projection, width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            cx: width / 2.0,
            cy: height / 2.0,
            hfov: hfov_from_focal(width, self.focal, projection),
            projection,
            distortion: [0.0; 3],
            norm: width.min(height) / 2.0,
            focal: self.focal,
        }
    }

    pub fn focal(&self) -> f64 {
        self.focal
    }

    pub fn hfov(&self) -> f64 {
        self.hfov
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    pub fn distortion(&self) -> [f64; 3] {
        self.distortion
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x < self.width && y < self.height
    }

    /// Unit ray through pixel `(x, y)`, or `None` outside the projection's domain
    pub fn pixel_to_ray(&self, x: f64, y: f64) -> Option<Vector3<f64>> {
        let (dx, dy) = self.undistort(x - self.cx, y - self.cy);
        let f = self.focal;
        let ray = match self.projection {
            Projection::Equirectangular => {
                let lon = dx / f;
                let lat = dy / f;
                if lat.abs() > std::f64::consts::FRAC_PI_2 {
                    return None;
                }
                Vector3::new(lat.cos() * lon.sin(), lat.sin(), lat.cos() * lon.cos())
            }
            Projection::Rectilinear => radial_ray(dx, dy, |r| (r / f).atan())?,
            Projection::Fisheye => radial_ray(dx, dy, |r| r / f)?,
            Projection::Stereographic => radial_ray(dx, dy, |r| 2.0 * (r / (2.0 * f)).atan())?,
        };
        Some(ray.normalize())
    }

    /// Pixel hit by `ray`, or `None` when the ray cannot be imaged by this projection.
    /// The result may lie outside the image; check with [`CameraModel::contains`].
    pub fn ray_to_pixel(&self, ray: &Vector3<f64>) -> Option<(f64, f64)> {
        let n = ray.norm();
        if n < EPS {
            return None;
        }
        let v = ray / n;
        let f = self.focal;
        let (dx, dy) = match self.projection {
            Projection::Equirectangular => {
                let lon = v.x.atan2(v.z);
                let lat = v.y.clamp(-1.0, 1.0).asin();
                (f * lon, f * lat)
            }
            Projection::Rectilinear => {
                if v.z < EPS {
                    return None;
                }
                radial_offset(&v, |theta| f * theta.tan())
            }
            Projection::Fisheye => radial_offset(&v, |theta| f * theta),
            Projection::Stereographic => {
                if v.z.clamp(-1.0, 1.0).acos() > std::f64::consts::PI - 1e-6 {
                    return None;
                }
                radial_offset(&v, |theta| 2.0 * f * (theta / 2.0).tan())
            }
        };
        let (dx, dy) = self.distort(dx, dy);
        Some((self.cx + dx, self.cy + dy))
    }

    fn radial_factor(&self, rn: f64) -> f64 {
        let [a, b, c] = self.distortion;
        let d = 1.0 - a - b - c;
        ((a * rn + b) * rn + c) * rn + d
    }

    fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|c| c.abs() > 0.0)
    }

    /// Ideal offset to distorted offset
    fn distort(&self, dx: f64, dy: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (dx, dy);
        }
        let r = (dx * dx + dy * dy).sqrt();
        let k = self.radial_factor(r / self.norm);
        (dx * k, dy * k)
    }

    /// Distorted offset to ideal offset, Newton iterations on the radius
    fn undistort(&self, dx: f64, dy: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (dx, dy);
        }
        let rd = (dx * dx + dy * dy).sqrt();
        if rd < EPS {
            return (dx, dy);
        }
        let [a, b, c] = self.distortion;
        let d = 1.0 - a - b - c;
        let target = rd / self.norm;
        let mut rn = target;
        for _ in 0..20 {
            let g = rn * self.radial_factor(rn) - target;
            let dg = ((4.0 * a * rn + 3.0 * b) * rn + 2.0 * c) * rn + d;
            if dg.abs() < EPS {
                break;
            }
            let step = g / dg;
            rn -= step;
            if step.abs() < 1e-12 {
                break;
            }
        }
        let s = rn * self.norm / rd;
        (dx * s, dy * s)
    }
}

fn max_hfov(projection: Projection) -> f64 {
    match projection {
        Projection::Rectilinear => 179.0,
        Projection::Stereographic => 359.0,
        Projection::Fisheye | Projection::Equirectangular => 360.0,
    }
}

/// Focal length in pixels for an image `width` pixels wide spanning `hfov` degrees
pub fn focal_from_hfov(width: f64, hfov: f64, projection: Projection) -> f64 {
    let half = hfov.to_radians() / 2.0;
    let half_width = width / 2.0;
    match projection {
        Projection::Rectilinear => half_width / half.tan(),
        Projection::Fisheye => half_width / half,
        Projection::Stereographic => half_width / (2.0 * (half / 2.0).tan()),
        Projection::Equirectangular => width / hfov.to_radians(),
    }
}

/// Inverse of [`focal_from_hfov`]
pub fn hfov_from_focal(width: f64, focal: f64, projection: Projection) -> f64 {
    let half_width = width / 2.0;
    let half = match projection {
        Projection::Rectilinear => (half_width / focal).atan(),
        Projection::Fisheye => half_width / focal,
        Projection::Stereographic => 2.0 * (half_width / (2.0 * focal)).atan(),
        Projection::Equirectangular => width / focal / 2.0,
    };
    (2.0 * half).to_degrees()
}

/// Ray at off-axis angle `theta(r)` for a radial offset `(dx, dy)` from the centre
fn radial_ray(dx: f64, dy: f64, theta: impl Fn(f64) -> f64) -> Option<Vector3<f64>> {
    let r = (dx * dx + dy * dy).sqrt();
    if r < EPS {
        return Some(Vector3::new(0.0, 0.0, 1.0));
    }
    let theta = theta(r);
    if theta > std::f64::consts::PI {
        return None;
    }
    let s = theta.sin() / r;
    Some(Vector3::new(dx * s, dy * s, theta.cos()))
}

/// Offset from the centre for unit ray `v`, given the image radius `radius(theta)`
fn radial_offset(v: &Vector3<f64>, radius: impl Fn(f64) -> f64) -> (f64, f64) {
    let theta = v.z.clamp(-1.0, 1.0).acos();
    let rho = (v.x * v.x + v.y * v.y).sqrt();
    if rho < EPS {
        return (0.0, 0.0);
    }
    let r = radius(theta);
    (v.x / rho * r, v.y / rho * r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn camera(projection: Projection, hfov: f64) -> CameraModel {
        CameraModel::from_parts(1200.0, 800.0, hfov, projection, [0.0; 3])
    }

    #[test]
    fn test_centre_pixel_looks_forward() {
        for projection in [
            Projection::Rectilinear,
            Projection::Fisheye,
            Projection::Stereographic,
            Projection::Equirectangular,
        ] {
            let cam = camera(projection, 90.0);
            let ray = cam.pixel_to_ray(600.0, 400.0).unwrap();
            assert_abs_diff_eq!(ray.z, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_edge_pixel_matches_half_fov() {
        for projection in [Projection::Rectilinear, Projection::Fisheye, Projection::Stereographic] {
            let cam = camera(projection, 100.0);
            let ray = cam.pixel_to_ray(1200.0, 400.0).unwrap();
            let angle = ray.z.acos().to_degrees();
            assert_abs_diff_eq!(angle, 50.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_pixel_ray_round_trip_with_distortion() {
        let cam = CameraModel::from_parts(1200.0, 800.0, 70.0, Projection::Rectilinear, [0.01, -0.03, 0.02]);
        for &(x, y) in &[(10.0, 15.0), (600.0, 400.0), (1100.0, 700.0), (333.3, 777.7)] {
            let ray = cam.pixel_to_ray(x, y).unwrap();
            let (u, v) = cam.ray_to_pixel(&ray).unwrap();
            assert_abs_diff_eq!(u, x, epsilon = 1e-6);
            assert_abs_diff_eq!(v, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rectilinear_rejects_rays_behind() {
        let cam = camera(Projection::Rectilinear, 60.0);
        assert!(cam.ray_to_pixel(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        let fisheye = camera(Projection::Fisheye, 180.0);
        assert!(fisheye.ray_to_pixel(&Vector3::new(1.0, 0.0, -0.1)).is_some());
    }

    #[test]
    fn test_hfov_focal_inverse() {
        for projection in [
            Projection::Rectilinear,
            Projection::Fisheye,
            Projection::Stereographic,
            Projection::Equirectangular,
        ] {
            let f = focal_from_hfov(1000.0, 80.0, projection);
            assert_abs_diff_eq!(hfov_from_focal(1000.0, f, projection), 80.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_hfov_scale_widens() {
        let cam = camera(Projection::Rectilinear, 60.0);
        let wide = cam.with_hfov_scale(1.25);
        assert_abs_diff_eq!(wide.hfov(), 75.0, epsilon = 1e-9);
        assert!(wide.focal() < cam.focal());
    }

    #[test]
    fn test_pose_rotation_round_trip() {
        let pose = Pose::new(35.0, -20.0, 5.0);
        let back = Pose::from_rotation(&pose.rotation());
        assert_abs_diff_eq!(back.yaw, pose.yaw, epsilon = 1e-9);
        assert_abs_diff_eq!(back.pitch, pose.pitch, epsilon = 1e-9);
        assert_abs_diff_eq!(back.roll, pose.roll, epsilon = 1e-9);
    }

    #[test]
    fn test_positive_yaw_looks_right() {
        let forward = Pose::new(90.0, 0.0, 0.0).rotation() * Vector3::new(0.0, 0.0, 1.0);
        assert_abs_diff_eq!(forward.x, 1.0, epsilon = 1e-9);
        let up = Pose::new(0.0, 90.0, 0.0).rotation() * Vector3::new(0.0, 0.0, 1.0);
        assert_abs_diff_eq!(up.y, -1.0, epsilon = 1e-9);
    }
}
