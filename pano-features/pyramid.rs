use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use pano_core::Plane;

use crate::error::{AnalyzeError, AnalyzeResult};
use crate::types::OctaveLevel;

/// Blur already present in a freshly decoded image
const INPUT_SIGMA: f32 = 0.5;
/// Octaves stop once the shorter side would drop below this
const MIN_OCTAVE_SIDE: usize = 32;

pub(crate) type LumaFImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub(crate) fn to_luma(plane: &Plane) -> AnalyzeResult<LumaFImage> {
    ImageBuffer::from_raw(plane.width as u32, plane.height as u32, plane.data.clone()).ok_or(
        AnalyzeError::InvalidImageSize {
            width: plane.width as u32,
            height: plane.height as u32,
        },
    )
}

pub(crate) fn from_luma(img: LumaFImage) -> Plane {
    let (w, h) = img.dimensions();
    Plane::new(w as usize, h as usize, img.into_raw())
}

/// One octave: `S + 3` Gaussian layers and the `S + 2` differences between them
pub struct Octave {
    pub level: OctaveLevel,
    pub gaussians: Vec<Plane>,
    pub dogs: Vec<Plane>,
}

/// Gaussian / difference-of-Gaussian pyramid over a detection image
pub struct ScaleSpace {
    pub octaves: Vec<Octave>,
    pub scales_per_octave: usize,
    pub base_sigma: f32,
}

impl ScaleSpace {
    /// Number of octaves that fit an image of this size
    pub fn octave_count(width: usize, height: usize, max_octaves: usize) -> usize {
        let mut n = 0;
        let mut side = width.min(height);
        while side >= MIN_OCTAVE_SIDE && n < max_octaves {
            n += 1;
            side /= 2;
        }
        n
    }

    /// Total blur of layer `layer` within any octave, in that octave's pixels
    pub fn layer_sigma(&self, layer: f32) -> f32 {
        self.base_sigma * 2f32.powf(layer / self.scales_per_octave as f32)
    }

    pub fn build(image: &Plane, max_octaves: usize, scales_per_octave: usize, base_sigma: f32) -> AnalyzeResult<Self> {
        let n_octaves = Self::octave_count(image.width, image.height, max_octaves);
        if n_octaves == 0 {
            return Err(AnalyzeError::ImageTooSmall {
                width: image.width as u32,
                height: image.height as u32,
                min_size: MIN_OCTAVE_SIDE as u32,
            });
        }

        let s = scales_per_octave;
        let k = 2f32.powf(1.0 / s as f32);
        // Incremental blur from layer i-1 to layer i
        let increments: Vec<f32> = (1..s + 3)
            .map(|i| {
                let prev = base_sigma * k.powi(i as i32 - 1);
                let total = prev * k;
                (total * total - prev * prev).sqrt()
            })
            .collect();

        let seed_sigma = (base_sigma * base_sigma - INPUT_SIGMA * INPUT_SIGMA).sqrt();
        let mut seed = gaussian_blur_f32(&to_luma(image)?, seed_sigma);

        let mut octaves = Vec::with_capacity(n_octaves);
        for index in 0..n_octaves {
            let mut layers = Vec::with_capacity(s + 3);
            let mut current = seed;
            for sigma in &increments {
                let next = gaussian_blur_f32(&current, *sigma);
                layers.push(current);
                current = next;
            }
            layers.push(current);

            // Layer S has twice the base blur; subsampling it seeds the next octave
            seed = subsample(&layers[s]);

            let gaussians: Vec<Plane> = layers.into_iter().map(from_luma).collect();
            let dogs = gaussians.windows(2).map(|w| difference(&w[1], &w[0])).collect();
            let level = OctaveLevel {
                index,
                width: gaussians[0].width,
                height: gaussians[0].height,
            };
            octaves.push(Octave { level, gaussians, dogs });
        }

        Ok(Self {
            octaves,
            scales_per_octave,
            base_sigma,
        })
    }
}

/// Every second pixel, so octave pixel `x` sits exactly on parent pixel `2x`
fn subsample(img: &LumaFImage) -> LumaFImage {
    let (w, h) = img.dimensions();
    ImageBuffer::from_fn((w / 2).max(1), (h / 2).max(1), |x, y| *img.get_pixel(x * 2, y * 2))
}

fn difference(a: &Plane, b: &Plane) -> Plane {
    let data = a.data.iter().zip(b.data.iter()).map(|(p, q)| p - q).collect();
    Plane::new(a.width, a.height, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_plane(w: usize, h: usize) -> Plane {
        let mut data = vec![0.1f32; w * h];
        for y in 0..h {
            for x in 0..w {
                let d2 = (x as f32 - 64.0).powi(2) + (y as f32 - 50.0).powi(2);
                data[y * w + x] += 0.8 * (-d2 / (2.0 * 16.0)).exp();
            }
        }
        Plane::new(w, h, data)
    }

    #[test]
    fn test_octave_count() {
        assert_eq!(ScaleSpace::octave_count(640, 480, 8), 4);
        assert_eq!(ScaleSpace::octave_count(640, 480, 2), 2);
        assert_eq!(ScaleSpace::octave_count(20, 480, 8), 0);
    }

    #[test]
    fn test_layer_layout() {
        let space = ScaleSpace::build(&blob_plane(128, 100), 4, 3, 1.6).unwrap();
        assert_eq!(space.octaves.len(), 2);
        for octave in &space.octaves {
            assert_eq!(octave.gaussians.len(), 6);
            assert_eq!(octave.dogs.len(), 5);
        }
        assert_eq!(space.octaves[1].level.width, 64);
        assert_eq!(space.octaves[1].level.height, 50);
        assert!((space.layer_sigma(3.0) - 3.2).abs() < 1e-5);
    }

    #[test]
    fn test_dog_is_negative_on_bright_blob() {
        let space = ScaleSpace::build(&blob_plane(128, 100), 1, 3, 1.6).unwrap();
        let dog = &space.octaves[0].dogs[1];
        assert!(dog.at(64, 50) < 0.0);
    }

    #[test]
    fn test_too_small_image_is_rejected() {
        let tiny = Plane::zeros(16, 16);
        assert!(matches!(
            ScaleSpace::build(&tiny, 4, 3, 1.6),
            Err(AnalyzeError::ImageTooSmall { .. })
        ));
    }
}
