use std::collections::BTreeMap;
use std::sync::Arc;

use image::GrayImage;
use pano_core::{Descriptor, GridSieve, ImageInfo, Keypoint, KeypointSet, Plane, DESCRIPTOR_LEN};
use pano_descriptor::{DescriptorGenerator, DescriptorSite};
use tracing::debug;

use crate::builder::AnalyzerBuilder;
use crate::cloud::CloudFilter;
use crate::config::AnalyzerConfig;
use crate::detector::ExtremaDetector;
use crate::error::{AnalyzeError, AnalyzeResult};
use crate::pyramid::ScaleSpace;
use crate::remap::DetectionTransform;
use crate::types::Candidate;

/// Supplies decoded pixels for an image
pub trait ImageSource: Send + Sync {
    fn load(&self, info: &ImageInfo) -> AnalyzeResult<GrayImage>;
}

/// Decodes `ImageInfo::filename` with the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageSource;

impl ImageSource for FileImageSource {
    fn load(&self, info: &ImageInfo) -> AnalyzeResult<GrayImage> {
        image::open(&info.filename)
            .map(|img| img.to_luma8())
            .map_err(|e| AnalyzeError::Decode {
                path: info.filename.clone(),
                reason: e.to_string(),
            })
    }
}

/// Turns one image into a `KeypointSet` in native pixel coordinates
pub struct ImageAnalyzer {
    config: AnalyzerConfig,
    source: Arc<dyn ImageSource>,
    detector: ExtremaDetector,
    descriptors: DescriptorGenerator,
    cloud: Option<CloudFilter>,
}

impl ImageAnalyzer {
    pub fn new(config: AnalyzerConfig) -> AnalyzeResult<Self> {
        AnalyzerBuilder::from_config(config).build()
    }

    pub fn builder() -> AnalyzerBuilder {
        AnalyzerBuilder::new()
    }

    pub(crate) fn from_parts(config: AnalyzerConfig, source: Arc<dyn ImageSource>, cloud: Option<CloudFilter>) -> Self {
        Self {
            detector: ExtremaDetector::new(&config),
            descriptors: DescriptorGenerator::default(),
            config,
            source,
            cloud,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn cloud_filter(&self) -> Option<&CloudFilter> {
        self.cloud.as_ref()
    }

    /// Remap and downscale decisions for `info`
    pub fn plan(&self, info: &ImageInfo) -> DetectionTransform {
        DetectionTransform::plan(
            info,
            self.config.remap_threshold_deg,
            self.config.downscale,
            self.config.downscale_limit,
        )
    }

    /// Decode and analyze
    pub fn analyze(&self, info: &ImageInfo) -> AnalyzeResult<KeypointSet> {
        let gray = self.source.load(info).map_err(|e| match e {
            AnalyzeError::Decode { reason, .. } => AnalyzeError::Decode {
                path: info.filename.clone(),
                reason,
            },
            other => other,
        })?;
        self.analyze_image(info, &gray)
    }

    /// Analyze already decoded pixels
    pub fn analyze_image(&self, info: &ImageInfo, gray: &GrayImage) -> AnalyzeResult<KeypointSet> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Err(AnalyzeError::InvalidImageSize { width: w, height: h });
        }
        let info = if info.width == 0 || info.height == 0 {
            ImageInfo {
                width: w,
                height: h,
                ..info.clone()
            }
        } else if (info.width, info.height) != (w, h) {
            return Err(AnalyzeError::SizeMismatch {
                expected: (info.width, info.height),
                actual: (w, h),
            });
        } else {
            info.clone()
        };

        let transform = self.plan(&info);
        let native = Plane::new(
            w as usize,
            h as usize,
            gray.as_raw().iter().map(|&p| p as f32 / 255.0).collect(),
        );
        let detection = transform.forward(native)?;
        debug!(
            "{}: detection image {}x{} (remap: {}, downscale: {})",
            info.label(),
            detection.width,
            detection.height,
            transform.remap.is_some(),
            transform.downscale
        );

        let keypoints = self.detect(&detection, &transform, w, h)?;
        debug!("{}: {} keypoints", info.label(), keypoints.len());
        Ok(KeypointSet::new(info.index, w, h, keypoints))
    }

    fn detect(&self, detection: &Plane, transform: &DetectionTransform, w: u32, h: u32) -> AnalyzeResult<Vec<Keypoint>> {
        let cfg = &self.config;
        let space = ScaleSpace::build(detection, cfg.max_octaves, cfg.scales_per_octave, cfg.base_sigma)?;

        let mut candidates = self.detector.detect(&space);
        let found = candidates.len();
        if let Some(cloud) = &self.cloud {
            candidates = cloud.apply(detection, candidates);
        }
        let after_cloud = candidates.len();

        let sieve = GridSieve::new(
            detection.width as f64,
            detection.height as f64,
            cfg.sieve1_width,
            cfg.sieve1_height,
            cfg.sieve1_size,
        );
        let candidates = sieve.apply(
            candidates,
            |c| {
                let (x, y) = c.detection_position();
                (x as f64, y as f64)
            },
            |a, b| b.response.total_cmp(&a.response),
        );
        debug!("extrema: {} found, {} after cloud filter, {} after sieve", found, after_cloud, candidates.len());

        let descriptors = self.describe(&space, &candidates);
        drop(space);

        let max_x = w as f64 - 1.0;
        let max_y = h as f64 - 1.0;
        let scale = transform.downscale as f64;
        Ok(candidates
            .iter()
            .zip(descriptors)
            .filter_map(|(c, descriptor)| {
                let (dx, dy) = c.detection_position();
                let (x, y) = transform.to_native(dx as f64, dy as f64)?;
                if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
                    return None;
                }
                Some(Keypoint {
                    x,
                    y,
                    scale: c.detection_sigma() as f64 * scale,
                    orientation: c.orientation as f64,
                    response: c.response as f64,
                    descriptor,
                })
            })
            .collect())
    }

    /// Descriptors for every candidate, batched per scale-space layer
    fn describe(&self, space: &ScaleSpace, candidates: &[Candidate]) -> Vec<Descriptor> {
        let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
        for (i, c) in candidates.iter().enumerate() {
            groups.entry((c.octave, c.layer)).or_default().push(i);
        }

        let mut out = vec![[0.0f32; DESCRIPTOR_LEN]; candidates.len()];
        for ((octave, layer), members) in groups {
            let sites: Vec<DescriptorSite> = members
                .iter()
                .map(|&i| {
                    let c = &candidates[i];
                    DescriptorSite {
                        x: c.x,
                        y: c.y,
                        scale: c.sigma,
                        orientation: c.orientation,
                    }
                })
                .collect();
            let plane = &space.octaves[octave].gaussians[layer];
            for (i, d) in members.into_iter().zip(self.descriptors.generate_descriptors(plane, &sites)) {
                out[i] = d;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Luma;

    /// Scattered Gaussian blobs of varying size on a mid-grey background
    fn blob_image(w: u32, h: u32, seed: u32) -> GrayImage {
        let mut blobs = Vec::new();
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(12345);
        for _ in 0..40 {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            let x = (state >> 8) % w;
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            let y = (state >> 8) % h;
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            let s = 2.0 + ((state >> 8) % 5) as f32;
            blobs.push((x as f32, y as f32, s));
        }
        GrayImage::from_fn(w, h, |x, y| {
            let mut v = 60.0f32;
            for &(bx, by, s) in &blobs {
                let d2 = (x as f32 - bx).powi(2) + (y as f32 - by).powi(2);
                v += 150.0 * (-d2 / (2.0 * s * s)).exp();
            }
            Luma([v.min(255.0) as u8])
        })
    }

    struct MemorySource(GrayImage);

    impl ImageSource for MemorySource {
        fn load(&self, _info: &ImageInfo) -> AnalyzeResult<GrayImage> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    impl ImageSource for BrokenSource {
        fn load(&self, info: &ImageInfo) -> AnalyzeResult<GrayImage> {
            Err(AnalyzeError::Decode {
                path: info.filename.clone(),
                reason: "truncated".to_string(),
            })
        }
    }

    #[test]
    fn test_keypoints_are_in_native_space() {
        let img = blob_image(320, 240, 1);
        let info = ImageInfo::new(2, "blobs.png", 320, 240, 50.0);
        let analyzer = ImageAnalyzer::builder()
            .source(Arc::new(MemorySource(img)))
            .build()
            .unwrap();
        let set = analyzer.analyze(&info).unwrap();
        assert_eq!(set.image, 2);
        assert!(!set.is_empty());
        for k in &set.keypoints {
            assert!(k.x >= 0.0 && k.x < 320.0 && k.y >= 0.0 && k.y < 240.0);
            let norm: f32 = k.descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_sieve_caps_keypoint_count() {
        let img = blob_image(320, 240, 7);
        let info = ImageInfo::new(0, "blobs.png", 320, 240, 50.0);
        let analyzer = ImageAnalyzer::builder().sieve1(2, 2, 3).build().unwrap();
        let set = analyzer.analyze_image(&info, &img).unwrap();
        assert!(set.len() <= 12);
    }

    #[test]
    fn test_downscaled_keypoints_map_back() {
        // Same content at two sizes; halving must map keypoints back onto the large image
        let small = blob_image(300, 200, 3);
        let large = image::imageops::resize(&small, 600, 400, image::imageops::FilterType::Triangle);
        let info = ImageInfo::new(0, "big.png", 600, 400, 50.0);
        let analyzer = ImageAnalyzer::builder().downscale_limit(512).build().unwrap();
        assert_eq!(analyzer.plan(&info).downscale, 2);

        let set = analyzer.analyze_image(&info, &large).unwrap();
        assert!(!set.is_empty());
        assert!(set.keypoints.iter().any(|k| k.x > 300.0 || k.y > 200.0));
    }

    #[test]
    fn test_decode_failure_is_an_error() {
        let analyzer = ImageAnalyzer::builder().source(Arc::new(BrokenSource)).build().unwrap();
        let info = ImageInfo::new(0, "missing.jpg", 100, 100, 50.0);
        match analyzer.analyze(&info) {
            Err(AnalyzeError::Decode { path, .. }) => assert_eq!(path, info.filename),
            other => panic!("expected decode error, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_size_mismatch_and_tiny_images() {
        let analyzer = ImageAnalyzer::new(AnalyzerConfig::default()).unwrap();
        let img = blob_image(64, 64, 2);
        let wrong = ImageInfo::new(0, "a.png", 128, 64, 50.0);
        assert!(matches!(analyzer.analyze_image(&wrong, &img), Err(AnalyzeError::SizeMismatch { .. })));

        let tiny = GrayImage::new(10, 10);
        let info = ImageInfo::new(0, "t.png", 10, 10, 50.0);
        assert!(matches!(analyzer.analyze_image(&info, &tiny), Err(AnalyzeError::ImageTooSmall { .. })));
    }

    #[test]
    fn test_wide_image_is_remapped_and_mapped_back() {
        let img = blob_image(400, 300, 5);
        let info = ImageInfo::new(0, "wide.png", 400, 300, 100.0);
        let analyzer = ImageAnalyzer::new(AnalyzerConfig::default()).unwrap();
        let plan = analyzer.plan(&info);
        assert!(plan.remap.is_some());

        let set = analyzer.analyze_image(&info, &img).unwrap();
        for k in &set.keypoints {
            assert!(k.x >= 0.0 && k.x <= 399.0 && k.y >= 0.0 && k.y <= 299.0);
            // Each keypoint must land where the forward transform says it was detected
            let (dx, dy) = plan.to_detection(k.x, k.y).unwrap();
            let (bx, by) = plan.to_native(dx, dy).unwrap();
            assert_abs_diff_eq!(bx, k.x, epsilon = 1e-6);
            assert_abs_diff_eq!(by, k.y, epsilon = 1e-6);
        }
    }
}
