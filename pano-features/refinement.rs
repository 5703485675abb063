use nalgebra::{Matrix3, Vector3};
use pano_core::Plane;
use std::f32::consts::PI;

const MAX_INTERPOLATION_STEPS: usize = 5;
/// Pixels at the octave border that never hold extrema
pub const IMAGE_BORDER: usize = 5;
const ORIENTATION_BINS: usize = 36;

/// Extremum after quadratic interpolation in (x, y, layer)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refined {
    pub x: f32,
    pub y: f32,
    pub layer: usize,
    /// Sub-layer offset in [-0.5, 0.5]
    pub layer_offset: f32,
    /// Interpolated DoG value at the extremum
    pub value: f32,
}

/// Sub-pixel refinement, edge rejection and orientation assignment
pub struct KeypointRefinement;

impl KeypointRefinement {
    /// Fit a 3D quadratic around a discrete extremum and move to its peak.
    ///
    /// Returns `None` when the fit does not converge, leaves the valid layer range
    /// or walks into the border.
    pub fn interpolate(dogs: &[Plane], layer: usize, x: usize, y: usize) -> Option<Refined> {
        let last_layer = dogs.len().checked_sub(2)?;
        let (mut layer, mut x, mut y) = (layer, x, y);

        for _ in 0..MAX_INTERPOLATION_STEPS {
            let prev = &dogs[layer - 1];
            let curr = &dogs[layer];
            let next = &dogs[layer + 1];

            let g = Vector3::new(
                (curr.at(x + 1, y) - curr.at(x - 1, y)) / 2.0,
                (curr.at(x, y + 1) - curr.at(x, y - 1)) / 2.0,
                (next.at(x, y) - prev.at(x, y)) / 2.0,
            );

            let v2 = curr.at(x, y) * 2.0;
            let dxx = curr.at(x + 1, y) + curr.at(x - 1, y) - v2;
            let dyy = curr.at(x, y + 1) + curr.at(x, y - 1) - v2;
            let dss = next.at(x, y) + prev.at(x, y) - v2;
            let dxy = (curr.at(x + 1, y + 1) - curr.at(x - 1, y + 1) - curr.at(x + 1, y - 1)
                + curr.at(x - 1, y - 1))
                / 4.0;
            let dxs = (next.at(x + 1, y) - next.at(x - 1, y) - prev.at(x + 1, y) + prev.at(x - 1, y)) / 4.0;
            let dys = (next.at(x, y + 1) - next.at(x, y - 1) - prev.at(x, y + 1) + prev.at(x, y - 1)) / 4.0;

            let h = Matrix3::new(dxx, dxy, dxs, dxy, dyy, dys, dxs, dys, dss);
            let offset = -h.lu().solve(&g)?;

            if offset.iter().all(|o| o.abs() < 0.5) {
                return Some(Refined {
                    x: x as f32 + offset.x,
                    y: y as f32 + offset.y,
                    layer,
                    layer_offset: offset.z,
                    value: curr.at(x, y) + g.dot(&offset) / 2.0,
                });
            }

            // Peak belongs to a neighbouring sample; step there and refit
            let nx = x as isize + offset.x.round() as isize;
            let ny = y as isize + offset.y.round() as isize;
            let nl = layer as isize + offset.z.round() as isize;
            if nl < 1
                || nl as usize > last_layer
                || nx < IMAGE_BORDER as isize
                || ny < IMAGE_BORDER as isize
                || nx as usize >= curr.width - IMAGE_BORDER
                || ny as usize >= curr.height - IMAGE_BORDER
            {
                return None;
            }
            x = nx as usize;
            y = ny as usize;
            layer = nl as usize;
        }
        None
    }

    /// Ratio of principal curvatures above `edge_threshold` marks an edge response
    pub fn is_edge(dog: &Plane, x: usize, y: usize, edge_threshold: f32) -> bool {
        let v2 = dog.at(x, y) * 2.0;
        let dxx = dog.at(x + 1, y) + dog.at(x - 1, y) - v2;
        let dyy = dog.at(x, y + 1) + dog.at(x, y - 1) - v2;
        let dxy = (dog.at(x + 1, y + 1) - dog.at(x - 1, y + 1) - dog.at(x + 1, y - 1) + dog.at(x - 1, y - 1)) / 4.0;

        let tr = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        if det <= 0.0 {
            return true;
        }
        tr * tr * edge_threshold > (edge_threshold + 1.0).powi(2) * det
    }

    /// Dominant gradient direction around `(x, y)` from a smoothed 36-bin histogram
    pub fn dominant_orientation(gauss: &Plane, x: f32, y: f32, sigma: f32) -> f32 {
        let weight_sigma = 1.5 * sigma;
        let radius = (3.0 * weight_sigma).round().max(1.0) as isize;
        let inv = -1.0 / (2.0 * weight_sigma * weight_sigma);
        let cx = x.round() as isize;
        let cy = y.round() as isize;

        let mut hist = [0.0f32; ORIENTATION_BINS];
        for dy in -radius..=radius {
            let py = cy + dy;
            if py <= 0 || py >= gauss.height as isize - 1 {
                continue;
            }
            for dx in -radius..=radius {
                let px = cx + dx;
                if px <= 0 || px >= gauss.width as isize - 1 {
                    continue;
                }
                let (px, py) = (px as usize, py as usize);
                let gx = gauss.at(px + 1, py) - gauss.at(px - 1, py);
                let gy = gauss.at(px, py + 1) - gauss.at(px, py - 1);
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                let w = ((dx * dx + dy * dy) as f32 * inv).exp();
                let bin = (gy.atan2(gx) * ORIENTATION_BINS as f32 / (2.0 * PI)).round() as isize;
                hist[bin.rem_euclid(ORIENTATION_BINS as isize) as usize] += w * magnitude;
            }
        }

        let n = ORIENTATION_BINS as isize;
        let at = |i: isize| hist[i.rem_euclid(n) as usize];
        let smoothed: Vec<f32> = (0..n)
            .map(|i| (at(i - 2) + at(i + 2)) / 16.0 + (at(i - 1) + at(i + 1)) * 4.0 / 16.0 + at(i) * 6.0 / 16.0)
            .collect();

        let mut peak = 0usize;
        for (i, v) in smoothed.iter().enumerate() {
            if *v > smoothed[peak] {
                peak = i;
            }
        }
        if smoothed[peak] <= 0.0 {
            return 0.0;
        }

        // Parabolic interpolation of the peak
        let p = peak as isize;
        let left = smoothed[(p - 1).rem_euclid(n) as usize];
        let right = smoothed[(p + 1).rem_euclid(n) as usize];
        let centre = smoothed[peak];
        let denom = left - 2.0 * centre + right;
        let shift = if denom.abs() > f32::EPSILON {
            (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };

        let angle = (peak as f32 + shift) * 2.0 * PI / ORIENTATION_BINS as f32;
        if angle > PI {
            angle - 2.0 * PI
        } else {
            angle
        }
    }
}
