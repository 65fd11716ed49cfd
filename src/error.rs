
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EfapsError {
    #[error("Attribute decode error: {0}")]
    AttributeDecode(String),
    #[error("Unsupported attribute operation: {0}")]
    UnsupportedAttributeOperation(String),
    #[error("Attribute '{attribute}' not found on type '{type_name}'")]
    AttributeNotFound { type_name: String, attribute: String },
    #[error("Type '{0}' not found")]
    TypeNotFound(String),
    #[error("Cache '{0}' is not initialized yet")]
    CacheNotReady(&'static str),
    #[error("Cache '{kind}' has no entry for {key}")]
    CacheIntegrity { kind: &'static str, key: String },
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl EfapsError {
    /// Only a lookup against a cache that has not been loaded yet may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheNotReady(_))
    }
}

pub type Result<T> = std::result::Result<T, EfapsError>;

// Helper conversions
impl From<rusqlite::Error> for EfapsError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for EfapsError {
    fn from(e: serde_json::Error) -> Self { Self::Execution(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for EfapsError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
