use pano_core::{ImageInfo, Projection};

use crate::model::ModelKind;

/// Chooses the RANSAC model for a pair when the configured mode is `auto`
pub trait ModelSelector: Send + Sync {
    fn select(&self, a: &ImageInfo, b: &ImageInfo) -> ModelKind;
}

/// Picks a homography for narrow rectilinear pairs and a rotation model otherwise.
///
/// Rotation alone is trusted only when both fields of view are reliable; when either is
/// a guess the field of view is estimated too.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FovModelSelector {
    /// Widest horizontal field of view, in degrees, still treated as planar
    pub homography_max_fov: f64,
}

impl Default for FovModelSelector {
    fn default() -> Self {
        Self {
            homography_max_fov: 65.0,
        }
    }
}

impl ModelSelector for FovModelSelector {
    fn select(&self, a: &ImageInfo, b: &ImageInfo) -> ModelKind {
        let narrow = |info: &ImageInfo| {
            info.projection == Projection::Rectilinear && info.hfov < self.homography_max_fov
        };
        if narrow(a) && narrow(b) {
            ModelKind::Homography
        } else if a.fov_reliable && b.fov_reliable {
            ModelKind::Rpy
        } else {
            ModelKind::Rpyv
        }
    }
}
