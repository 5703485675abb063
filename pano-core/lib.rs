//! Shared data model for panorama control-point detection.
//!
//! Everything the analysis, matching and orchestration crates exchange lives here:
//! per-image metadata, keypoints with their descriptors, control points, the camera
//! model used to turn pixels into rays, and the grid sieve used twice in the pipeline.

pub mod camera;
pub mod sieve;

use std::path::PathBuf;

pub use camera::{CameraModel, Pose};
pub use sieve::GridSieve;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of floats in a keypoint descriptor
pub const DESCRIPTOR_LEN: usize = 64;

/// Real-valued, L2-normalized gradient descriptor
pub type Descriptor = [f32; DESCRIPTOR_LEN];

/// Projection of a source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Projection {
    #[default]
    Rectilinear,
    /// Equidistant fisheye, full frame or circular
    Fisheye,
    Stereographic,
    Equirectangular,
}

/// Metadata for one project image.
///
/// Created once from project input; `index` is the position in the project's image list.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImageInfo {
    #[cfg_attr(feature = "serde", serde(skip))]
    pub index: usize,
    pub filename: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Horizontal field of view in degrees
    pub hfov: f64,
    pub projection: Projection,
    /// Radial distortion polynomial coefficients `a`, `b`, `c`
    pub distortion: [f64; 3],
    pub exposure_value: f64,
    /// Bracketed stack this image belongs to
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub stack: Option<usize>,
    pub lens: usize,
    /// Whether `hfov` came from trustworthy metadata rather than a guess
    pub fov_reliable: bool,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub pose: Option<Pose>,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            index: 0,
            filename: PathBuf::new(),
            width: 0,
            height: 0,
            hfov: 50.0,
            projection: Projection::Rectilinear,
            distortion: [0.0; 3],
            exposure_value: 0.0,
            stack: None,
            lens: 0,
            fov_reliable: false,
            pose: None,
        }
    }
}

impl ImageInfo {
    pub fn new(index: usize, filename: impl Into<PathBuf>, width: u32, height: u32, hfov: f64) -> Self {
        Self {
            index,
            filename: filename.into(),
            width,
            height,
            hfov,
            ..Self::default()
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn with_stack(mut self, stack: usize, exposure_value: f64) -> Self {
        self.stack = Some(stack);
        self.exposure_value = exposure_value;
        self
    }

    /// Larger of width and height
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }

    /// Short human-readable label for logs
    pub fn label(&self) -> String {
        format!("image {} ({})", self.index, self.filename.display())
    }

    pub fn camera(&self) -> CameraModel {
        CameraModel::new(self)
    }
}

/// Scale-space keypoint with orientation and descriptor.
///
/// `x`/`y` are sub-pixel positions. Once a keypoint leaves the analyzer they are in the
/// image's native pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    /// Radians
    pub orientation: f64,
    pub response: f64,
    pub descriptor: Descriptor,
}

impl Keypoint {
    pub fn squared_distance(&self, other: &Keypoint) -> f32 {
        descriptor_distance(&self.descriptor, &other.descriptor)
    }
}

/// Squared Euclidean distance between two descriptors
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> f32 {
    a.iter().zip(b.iter()).map(|(p, q)| (p - q) * (p - q)).sum()
}

/// All keypoints of one image, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointSet {
    pub image: usize,
    pub width: u32,
    pub height: u32,
    pub keypoints: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(image: usize, width: u32, height: u32, keypoints: Vec<Keypoint>) -> Self {
        Self { image, width, height, keypoints }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Which axes a control point constrains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConstraintMode {
    #[default]
    BothAxes,
    HorizontalOnly,
    VerticalOnly,
}

/// A correspondence between two images, both coordinates in native pixel space
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ControlPoint {
    pub image1: usize,
    pub x1: f64,
    pub y1: f64,
    pub image2: usize,
    pub x2: f64,
    pub y2: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub mode: ConstraintMode,
}

impl ControlPoint {
    pub fn pair(&self) -> ImagePair {
        ImagePair::new(self.image1, self.image2)
    }
}

/// Unordered image pair, stored with the smaller index first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImagePair {
    pub first: usize,
    pub second: usize,
}

impl ImagePair {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn contains(&self, image: usize) -> bool {
        self.first == image || self.second == image
    }
}

impl std::fmt::Display for ImagePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}

/// Row-major single-channel float image used for scale-space levels
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self { width, height, data }
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self { width, height, data: vec![0.0; width * height] }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with edge clamping
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// Number of hardware threads, at least one
pub fn hardware_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Build a dedicated Rayon pool with the given number of workers
pub fn build_thread_pool(n_threads: usize) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads.max(1))
        .thread_name(|i| format!("pano-worker-{}", i))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_pair_is_normalized() {
        let p = ImagePair::new(5, 2);
        assert_eq!(p.first, 2);
        assert_eq!(p.second, 5);
        assert_eq!(p, ImagePair::new(2, 5));
        assert!(p.contains(5));
        assert!(!p.contains(3));
    }

    #[test]
    fn test_descriptor_distance() {
        let mut a = [0.0f32; DESCRIPTOR_LEN];
        let mut b = [0.0f32; DESCRIPTOR_LEN];
        a[0] = 1.0;
        b[1] = 1.0;
        assert_eq!(descriptor_distance(&a, &b), 2.0);
        assert_eq!(descriptor_distance(&a, &a), 0.0);
    }

    #[test]
    fn test_plane_bilinear_sample() {
        let plane = Plane::new(2, 2, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(plane.sample(0.0, 0.0), 0.0);
        assert_eq!(plane.sample(0.5, 0.0), 0.5);
        assert_eq!(plane.sample(0.5, 0.5), 1.5);
        // Clamped outside the image
        assert_eq!(plane.sample(-3.0, 10.0), 2.0);
    }

    #[test]
    fn test_thread_pool_builds() {
        let pool = build_thread_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        assert!(hardware_concurrency() >= 1);
    }
}
