#[derive(Debug, Clone, PartialEq)]
pub enum MatchError {
    InvalidConfig(String),
    UnknownRansacMode(String),
    TooFewPoints { needed: usize, got: usize },
    NumericalFailure(String),
}

impl std::fmt::Display for MatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchError::InvalidConfig(msg) => write!(f, "Invalid matcher configuration: {}", msg),
            MatchError::UnknownRansacMode(mode) => {
                write!(f, "Unknown RANSAC mode '{}' (expected auto, hom, rpy, rpyv or rpyvb)", mode)
            }
            MatchError::TooFewPoints { needed, got } => {
                write!(f, "Too few points: need {}, got {}", needed, got)
            }
            MatchError::NumericalFailure(msg) => write!(f, "Numerical failure: {}", msg),
        }
    }
}

impl std::error::Error for MatchError {}

pub type MatchResult<T> = Result<T, MatchError>;
