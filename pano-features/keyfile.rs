//! Per-image keypoint cache.
//!
//! One JSON document per image, `<dir>/<file stem>.key.json`, holding the image identity
//! and every keypoint. A keyfile is only used when its identity matches the image.

use std::fs;
use std::path::{Path, PathBuf};

use pano_core::{Descriptor, ImageInfo, Keypoint, KeypointSet, DESCRIPTOR_LEN};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AnalyzeError, AnalyzeResult};

const KEYFILE_VERSION: u32 = 1;
const KEYFILE_SUFFIX: &str = "key.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Identity {
    filename: String,
    width: u32,
    height: u32,
}

impl Identity {
    fn of(info: &ImageInfo) -> Self {
        Self {
            filename: info.filename.to_string_lossy().into_owned(),
            width: info.width,
            height: info.height,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    x: f64,
    y: f64,
    scale: f64,
    orientation: f64,
    response: f64,
    descriptor: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    version: u32,
    image: Identity,
    keypoints: Vec<Entry>,
}

/// Cache location for `info` inside `dir`
pub fn keyfile_path(dir: &Path, info: &ImageInfo) -> PathBuf {
    let stem = info
        .filename
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("image{}", info.index));
    dir.join(format!("{}.{}", stem, KEYFILE_SUFFIX))
}

pub fn write_keyfile(path: &Path, info: &ImageInfo, set: &KeypointSet) -> AnalyzeResult<()> {
    let doc = Document {
        version: KEYFILE_VERSION,
        image: Identity::of(info),
        keypoints: set
            .keypoints
            .iter()
            .map(|k| Entry {
                x: k.x,
                y: k.y,
                scale: k.scale,
                orientation: k.orientation,
                response: k.response,
                descriptor: k.descriptor.to_vec(),
            })
            .collect(),
    };
    let json = serde_json::to_string(&doc).map_err(|e| keyfile_error(path, e))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
        }
    }
    fs::write(path, json).map_err(|e| io_error(path, e))?;
    debug!("wrote {} keypoints to {}", set.len(), path.display());
    Ok(())
}

pub fn read_keyfile(path: &Path, info: &ImageInfo) -> AnalyzeResult<KeypointSet> {
    let doc = read_document(path)?;
    if doc.image != Identity::of(info) {
        return Err(AnalyzeError::CacheMismatch { path: path.to_path_buf() });
    }

    let mut keypoints = Vec::with_capacity(doc.keypoints.len());
    for entry in doc.keypoints {
        let descriptor: Descriptor = entry.descriptor.as_slice().try_into().map_err(|_| AnalyzeError::Keyfile {
            path: path.to_path_buf(),
            reason: format!("descriptor has {} values, expected {}", entry.descriptor.len(), DESCRIPTOR_LEN),
        })?;
        keypoints.push(Keypoint {
            x: entry.x,
            y: entry.y,
            scale: entry.scale,
            orientation: entry.orientation,
            response: entry.response,
            descriptor,
        });
    }
    Ok(KeypointSet::new(info.index, info.width, info.height, keypoints))
}

/// Whether a readable keyfile for exactly this image exists
pub fn is_valid_keyfile(path: &Path, info: &ImageInfo) -> bool {
    match read_document(path) {
        Ok(doc) => doc.version == KEYFILE_VERSION && doc.image == Identity::of(info),
        Err(_) => false,
    }
}

/// Delete a keyfile; returns whether one existed
pub fn remove_keyfile(path: &Path) -> AnalyzeResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path, e)),
    }
}

fn read_document(path: &Path) -> AnalyzeResult<Document> {
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let doc: Document = serde_json::from_str(&content).map_err(|e| keyfile_error(path, e))?;
    if doc.version != KEYFILE_VERSION {
        return Err(AnalyzeError::Keyfile {
            path: path.to_path_buf(),
            reason: format!("unsupported version {}", doc.version),
        });
    }
    Ok(doc)
}

fn io_error(path: &Path, e: std::io::Error) -> AnalyzeError {
    AnalyzeError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn keyfile_error(path: &Path, e: serde_json::Error) -> AnalyzeError {
    AnalyzeError::Keyfile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
