use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum AnalyzeError {
    Decode { path: PathBuf, reason: String },
    InvalidImageSize { width: u32, height: u32 },
    ImageTooSmall { width: u32, height: u32, min_size: u32 },
    SizeMismatch { expected: (u32, u32), actual: (u32, u32) },
    InvalidConfig(String),
    Io { path: PathBuf, reason: String },
    Keyfile { path: PathBuf, reason: String },
    CacheMismatch { path: PathBuf },
}

impl std::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyzeError::Decode { path, reason } => {
                write!(f, "Failed to decode {}: {}", path.display(), reason)
            }
            AnalyzeError::InvalidImageSize { width, height } => {
                write!(f, "Invalid image dimensions: {}x{} (must be > 0)", width, height)
            }
            AnalyzeError::ImageTooSmall { width, height, min_size } => {
                write!(f, "Image {}x{} too small (minimum {}x{})", width, height, min_size, min_size)
            }
            AnalyzeError::SizeMismatch { expected, actual } => {
                write!(
                    f,
                    "Decoded size {}x{} does not match project size {}x{}",
                    actual.0, actual.1, expected.0, expected.1
                )
            }
            AnalyzeError::InvalidConfig(msg) => write!(f, "Invalid analyzer configuration: {}", msg),
            AnalyzeError::Io { path, reason } => write!(f, "I/O error on {}: {}", path.display(), reason),
            AnalyzeError::Keyfile { path, reason } => {
                write!(f, "Malformed keyfile {}: {}", path.display(), reason)
            }
            AnalyzeError::CacheMismatch { path } => {
                write!(f, "Keyfile {} belongs to a different image", path.display())
            }
        }
    }
}

impl std::error::Error for AnalyzeError {}

impl From<image::ImageError> for AnalyzeError {
    fn from(e: image::ImageError) -> Self {
        AnalyzeError::Decode {
            path: PathBuf::new(),
            reason: e.to_string(),
        }
    }
}

pub type AnalyzeResult<T> = Result<T, AnalyzeError>;
