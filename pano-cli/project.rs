//! Minimal project document: the image list and the control points found so far.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use pano_core::{ControlPoint, ImageInfo, ImagePair};
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, DetectorResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub images: Vec<ImageInfo>,
    #[serde(default)]
    pub control_points: Vec<ControlPoint>,
}

impl Project {
    /// Project over `images`, re-indexed by position
    pub fn new(images: Vec<ImageInfo>) -> Self {
        let mut project = Self {
            images,
            control_points: Vec::new(),
        };
        project.reindex();
        project
    }

    fn reindex(&mut self) {
        for (i, image) in self.images.iter_mut().enumerate() {
            image.index = i;
        }
    }

    /// Parse a project document without touching the file system
    pub fn from_json(json: &str) -> DetectorResult<Self> {
        let mut project: Self = serde_json::from_str(json).map_err(|e| DetectorError::Project {
            path: PathBuf::from("<memory>"),
            reason: e.to_string(),
        })?;
        project.reindex();
        project.check_control_points()?;
        Ok(project)
    }

    /// Read a project file; relative image paths resolve against its directory and
    /// every image must exist
    pub fn load<P: AsRef<Path>>(path: P) -> DetectorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DetectorError::Project {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut project = Self::from_json(&content).map_err(|e| match e {
            DetectorError::Project { reason, .. } => DetectorError::Project {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for image in project.images.iter_mut() {
            if image.filename.is_relative() {
                image.filename = base.join(&image.filename);
            }
            if !image.filename.is_file() {
                return Err(DetectorError::MissingImage {
                    index: image.index,
                    path: image.filename.clone(),
                });
            }
        }
        Ok(project)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> DetectorResult<()> {
        let path = path.as_ref();
        let io_err = |reason: String| DetectorError::Io {
            path: path.to_path_buf(),
            reason,
        };
        let json = self.to_json().map_err(|e| io_err(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| io_err(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Images without a pose
    pub fn missing_poses(&self) -> Vec<usize> {
        self.images
            .iter()
            .filter(|image| image.pose.is_none())
            .map(|image| image.index)
            .collect()
    }

    /// Pairs already joined by at least one control point
    pub fn connected_pairs(&self) -> HashSet<ImagePair> {
        self.control_points.iter().map(|cp| cp.pair()).collect()
    }

    fn check_control_points(&self) -> DetectorResult<()> {
        let n = self.images.len();
        match self
            .control_points
            .iter()
            .find(|cp| cp.image1 >= n || cp.image2 >= n || cp.image1 == cp.image2)
        {
            Some(cp) => Err(DetectorError::InvalidControlPoint {
                image1: cp.image1,
                image2: cp.image2,
                images: n,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "images": [
            { "filename": "a.jpg", "width": 1000, "height": 800, "hfov": 50.0 },
            { "filename": "b.jpg", "width": 1000, "height": 800, "hfov": 50.0,
              "pose": { "yaw": 30.0, "pitch": 0.0, "roll": 0.0 } }
        ],
        "control_points": [
            { "image1": 0, "x1": 900.0, "y1": 400.0, "image2": 1, "x2": 200.0, "y2": 400.0 }
        ]
    }"#;

    #[test]
    fn test_indices_follow_array_order() {
        let project = Project::from_json(DOC).unwrap();
        assert_eq!(project.len(), 2);
        assert_eq!(project.images[1].index, 1);
        assert_eq!(project.missing_poses(), vec![0]);
        assert!(project.connected_pairs().contains(&ImagePair::new(1, 0)));
    }

    #[test]
    fn test_rejects_dangling_control_point() {
        let doc = DOC.replace("\"image2\": 1", "\"image2\": 7");
        assert!(matches!(
            Project::from_json(&doc),
            Err(DetectorError::InvalidControlPoint { image2: 7, .. })
        ));
    }

    #[test]
    fn test_missing_image_file_fails_load() {
        let dir = std::env::temp_dir().join(format!("pano-project-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("project.json");
        std::fs::write(&path, DOC).unwrap();

        let result = Project::load(&path);
        assert!(matches!(result, Err(DetectorError::MissingImage { index: 0, .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unparseable_project() {
        assert!(matches!(Project::from_json("{ nope"), Err(DetectorError::Project { .. })));
    }
}
