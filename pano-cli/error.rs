use std::path::PathBuf;

use pano_features::AnalyzeError;
use pano_match::MatchError;

/// Configuration that cannot be honoured for the given project
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Prealigned matching requested but these images carry no pose
    MissingPoses(Vec<usize>),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingPoses(images) => {
                write!(f, "prealigned matching needs a pose for every image, missing for {:?}", images)
            }
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

/// One image that could not be analyzed
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFailure {
    pub index: usize,
    pub filename: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub enum DetectorError {
    Config(ConfigError),
    /// Project document could not be read or parsed
    Project { path: PathBuf, reason: String },
    MissingImage { index: usize, path: PathBuf },
    InvalidControlPoint { image1: usize, image2: usize, images: usize },
    ImagesFailed(Vec<ImageFailure>),
    Analyze(AnalyzeError),
    Match(MatchError),
    ThreadPool(rayon::ThreadPoolBuildError),
    Io { path: PathBuf, reason: String },
}

impl std::fmt::Display for DetectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorError::Config(e) => write!(f, "Configuration error: {}", e),
            DetectorError::Project { path, reason } => {
                write!(f, "Cannot read project {}: {}", path.display(), reason)
            }
            DetectorError::MissingImage { index, path } => {
                write!(f, "Image {} not found: {}", index, path.display())
            }
            DetectorError::InvalidControlPoint { image1, image2, images } => write!(
                f,
                "Control point between images {} and {} refers outside the {} project images",
                image1, image2, images
            ),
            DetectorError::ImagesFailed(failures) => {
                write!(f, "{} image(s) could not be analyzed:", failures.len())?;
                for failure in failures {
                    write!(f, "\n  image {} ({}): {}", failure.index, failure.filename.display(), failure.reason)?;
                }
                Ok(())
            }
            DetectorError::Analyze(e) => write!(f, "Analyzer error: {}", e),
            DetectorError::Match(e) => write!(f, "Matcher error: {}", e),
            DetectorError::ThreadPool(e) => write!(f, "Thread pool error: {}", e),
            DetectorError::Io { path, reason } => write!(f, "I/O error on {}: {}", path.display(), reason),
        }
    }
}

impl std::error::Error for DetectorError {}

impl From<ConfigError> for DetectorError {
    fn from(err: ConfigError) -> Self {
        DetectorError::Config(err)
    }
}

impl From<AnalyzeError> for DetectorError {
    fn from(err: AnalyzeError) -> Self {
        DetectorError::Analyze(err)
    }
}

impl From<MatchError> for DetectorError {
    fn from(err: MatchError) -> Self {
        DetectorError::Match(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for DetectorError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        DetectorError::ThreadPool(err)
    }
}

pub type DetectorResult<T> = Result<T, DetectorError>;
