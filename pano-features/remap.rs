//! Forward transforms from a native image to its detection image and back.
//!
//! Detection images are optionally remapped to stereographic projection (wide lenses)
//! and then optionally halved. Keypoints found in detection space must be mapped
//! back with [`DetectionTransform::to_native`] before anyone else sees them.

use image::imageops::{resize, FilterType};
use pano_core::{CameraModel, ImageInfo, Plane, Projection};
use rayon::prelude::*;

use crate::error::AnalyzeResult;
use crate::pyramid::{from_luma, to_luma};

/// Outline samples per image side when sizing the remapped image
const OUTLINE_SAMPLES: usize = 64;

/// Resampling of a wide-angle image into stereographic projection.
///
/// The target keeps the source focal length in pixels, so sampling density at the
/// image centre is unchanged. The target extent is the bounding box of the projected
/// source outline, centred on the optical axis.
#[derive(Debug, Clone, PartialEq)]
pub struct StereographicRemap {
    source: CameraModel,
    target: CameraModel,
    width: u32,
    height: u32,
}

impl StereographicRemap {
    /// Remap needed for `info`, or `None` when it can be analyzed as is
    pub fn plan(info: &ImageInfo, threshold_deg: f64) -> Option<Self> {
        if info.hfov <= threshold_deg || info.projection == Projection::Stereographic {
            return None;
        }
        Self::new(info.camera())
    }

    pub fn new(source: CameraModel) -> Option<Self> {
        let (sw, sh) = source.size();
        // Offsets from the optical centre do not depend on the target size
        let probe = source.with_projection(Projection::Stereographic, sw, sh);
        let (pcx, pcy) = (sw / 2.0, sh / 2.0);

        let mut half_w: f64 = 0.0;
        let mut half_h: f64 = 0.0;
        for (x, y) in outline(sw, sh) {
            let Some(ray) = source.pixel_to_ray(x, y) else { continue };
            let Some((u, v)) = probe.ray_to_pixel(&ray) else { continue };
            half_w = half_w.max((u - pcx).abs());
            half_h = half_h.max((v - pcy).abs());
        }
        if half_w < 1.0 || half_h < 1.0 {
            return None;
        }

        let width = (2.0 * half_w).ceil() as u32;
        let height = (2.0 * half_h).ceil() as u32;
        let target = source.with_projection(Projection::Stereographic, width as f64, height as f64);
        Some(Self {
            source,
            target,
            width,
            height,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn target_camera(&self) -> &CameraModel {
        &self.target
    }

    /// Remapped position to native position
    pub fn target_to_source(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let ray = self.target.pixel_to_ray(x, y)?;
        self.source.ray_to_pixel(&ray)
    }

    /// Native position to remapped position
    pub fn source_to_target(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let ray = self.source.pixel_to_ray(x, y)?;
        self.target.ray_to_pixel(&ray)
    }

    /// Resample `src` (native pixels) into the stereographic image.
    ///
    /// Target pixels with no source counterpart take the nearest border value.
    pub fn apply(&self, src: &Plane) -> Plane {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0.0f32; w * h];
        data.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = match self.target_to_source(x as f64, y as f64) {
                    Some((sx, sy)) => src.sample(sx as f32, sy as f32),
                    None => 0.0,
                };
            }
        });
        Plane::new(w, h, data)
    }
}

fn outline(w: f64, h: f64) -> impl Iterator<Item = (f64, f64)> {
    let n = OUTLINE_SAMPLES;
    (0..=n).flat_map(move |i| {
        let t = i as f64 / n as f64;
        [(t * w, 0.0), (t * w, h), (0.0, t * h), (w, t * h)]
    })
}

/// Composite native to detection transform of one image
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTransform {
    pub remap: Option<StereographicRemap>,
    /// Native (or remapped) pixels per detection pixel, 1 or 2
    pub downscale: u32,
    pub native_size: (u32, u32),
    pub detection_size: (u32, u32),
}

impl DetectionTransform {
    /// Decide remap and downscale for an image of the given size
    pub fn plan(info: &ImageInfo, remap_threshold_deg: f64, downscale: bool, downscale_limit: u32) -> Self {
        let remap = StereographicRemap::plan(info, remap_threshold_deg);
        let (rw, rh) = remap.as_ref().map(|r| r.size()).unwrap_or((info.width, info.height));
        let factor = if downscale && rw.max(rh) > downscale_limit { 2 } else { 1 };
        Self {
            remap,
            downscale: factor,
            native_size: (info.width, info.height),
            detection_size: ((rw / factor).max(1), (rh / factor).max(1)),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.remap.is_none() && self.downscale == 1
    }

    /// Pixels held by the largest buffer during analysis
    pub fn peak_area(&self) -> u64 {
        let (w, h) = self.native_size;
        let (rw, rh) = self.remap.as_ref().map(|r| r.size()).unwrap_or((w, h));
        (w as u64 * h as u64).max(rw as u64 * rh as u64)
    }

    /// Produce the detection image from native pixels
    pub fn forward(&self, native: Plane) -> AnalyzeResult<Plane> {
        let remapped = match &self.remap {
            Some(remap) => remap.apply(&native),
            None => native,
        };
        if self.downscale == 1 {
            return Ok(remapped);
        }
        let (w, h) = self.detection_size;
        Ok(from_luma(resize(&to_luma(&remapped)?, w, h, FilterType::Triangle)))
    }

    /// Detection position to native position
    pub fn to_native(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        // Pixel centres: detection pixel i covers remapped pixels [s*i, s*i + s)
        let s = self.downscale as f64;
        let (rx, ry) = ((x + 0.5) * s - 0.5, (y + 0.5) * s - 0.5);
        match &self.remap {
            Some(remap) => remap.target_to_source(rx, ry),
            None => Some((rx, ry)),
        }
    }

    /// Native position to detection position
    pub fn to_detection(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (rx, ry) = match &self.remap {
            Some(remap) => remap.source_to_target(x, y)?,
            None => (x, y),
        };
        let s = self.downscale as f64;
        Some(((rx + 0.5) / s - 0.5, (ry + 0.5) / s - 0.5))
    }
}
