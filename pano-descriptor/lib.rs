use pano_core::{Descriptor, Plane, DESCRIPTOR_LEN};
use rayon::prelude::*;

/// Sub-regions per side of the descriptor window
const GRID: usize = 4;
/// Samples per side of one sub-region
const SAMPLES_PER_REGION: usize = 5;
const WINDOW_SAMPLES: usize = GRID * SAMPLES_PER_REGION;

/// Where and how to sample one descriptor, in the coordinates of the level image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorSite {
    pub x: f32,
    pub y: f32,
    /// Blur sigma of the keypoint in level pixels
    pub scale: f32,
    /// Radians
    pub orientation: f32,
}

/// Oriented gradient descriptor: a 4x4 grid of sub-regions, each summarising
/// `(sum du, sum dv, sum |du|, sum |dv|)` of gradients expressed in the keypoint frame.
pub struct DescriptorGenerator {
    /// Sample spacing as a multiple of the keypoint scale
    step_factor: f32,
    /// Gaussian weighting sigma as a multiple of the sample spacing
    weight_sigma: f32,
}

impl Default for DescriptorGenerator {
    fn default() -> Self {
        Self {
            step_factor: 1.0,
            weight_sigma: 3.3,
        }
    }
}

impl DescriptorGenerator {
    pub fn new(step_factor: f32, weight_sigma: f32) -> Self {
        assert!(step_factor > 0.0 && weight_sigma > 0.0);
        Self { step_factor, weight_sigma }
    }

    pub fn generate_descriptors(&self, plane: &Plane, sites: &[DescriptorSite]) -> Vec<Descriptor> {
        sites.par_iter().map(|site| self.describe(plane, site)).collect()
    }

    pub fn describe(&self, plane: &Plane, site: &DescriptorSite) -> Descriptor {
        let step = (site.scale * self.step_factor).max(0.5);
        let (s, c) = site.orientation.sin_cos();
        let half = (WINDOW_SAMPLES as f32 - 1.0) / 2.0;
        let sigma = self.weight_sigma * SAMPLES_PER_REGION as f32 / 5.0 * step;
        let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

        let mut d = [0.0f32; DESCRIPTOR_LEN];

        for j in 0..WINDOW_SAMPLES {
            for i in 0..WINDOW_SAMPLES {
                // Offset in the keypoint frame
                let u = (i as f32 - half) * step;
                let v = (j as f32 - half) * step;

                // Rotate into the level image
                let px = site.x + c * u - s * v;
                let py = site.y + s * u + c * v;

                // Gradients along the rotated axes by central differences
                let du = self.sample(plane, px + c * step, py + s * step) - self.sample(plane, px - c * step, py - s * step);
                let dv = self.sample(plane, px - s * step, py + c * step) - self.sample(plane, px + s * step, py - c * step);

                let w = (-(u * u + v * v) * inv_two_sigma_sq).exp();
                let (du, dv) = (du * w, dv * w);

                let region = (j / SAMPLES_PER_REGION) * GRID + i / SAMPLES_PER_REGION;
                let slot = &mut d[region * 4..region * 4 + 4];
                slot[0] += du;
                slot[1] += dv;
                slot[2] += du.abs();
                slot[3] += dv.abs();
            }
        }

        let norm = d.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            d.iter_mut().for_each(|v| *v /= norm);
        }
        d
    }

    /// Bilinear sample; outside the image the nearest border pixel is used
    #[inline]
    fn sample(&self, plane: &Plane, x: f32, y: f32) -> f32 {
        plane.sample(x, y)
    }
}
