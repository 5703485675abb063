//! Keypoint analysis of a single panorama source image.
//!
//! [`ImageAnalyzer`] decodes an image, optionally remaps wide-angle input to
//! stereographic projection and halves large input, finds difference-of-Gaussian
//! extrema, thins them with a grid sieve, describes the survivors and maps every
//! keypoint back to native pixel coordinates.

pub mod analyzer;
pub mod builder;
pub mod cloud;
pub mod config;
pub mod detector;
pub mod error;
#[cfg(feature = "serde")]
pub mod keyfile;
pub mod pyramid;
pub mod refinement;
pub mod remap;
pub mod types;

pub use analyzer::{FileImageSource, ImageAnalyzer, ImageSource};
pub use builder::AnalyzerBuilder;
pub use cloud::{CloudFilter, CloudModel};
pub use config::{AnalyzerConfig, CloudSettings};
pub use error::{AnalyzeError, AnalyzeResult};
pub use remap::{DetectionTransform, StereographicRemap};
pub use types::Candidate;
