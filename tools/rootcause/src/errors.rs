use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RcaError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("normalization error: {0}")]
    Normalization(String),
    #[error("duplicate pattern: {0}")]
    DuplicatePattern(String),
    #[error("pattern not found: {0}")]
    PatternNotFound(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("pattern library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database error: {0}")]
    Database(String),
}
