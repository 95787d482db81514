use thiserror::Error;

/// Outcome of a cache load that produced no artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("malformed locator: {0}")]
    MalformedLocator(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("cache is closed")]
    Closed,
    #[error("store error: {0}")]
    Store(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Store(e.to_string())
    }
}
