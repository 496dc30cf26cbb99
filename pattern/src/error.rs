use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("class pattern must not be empty")]
    EmptyClassPattern,

    #[error("malformed pattern '{pattern}': {reason}")]
    Malformed { pattern: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PatternError>;
