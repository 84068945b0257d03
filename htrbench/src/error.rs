use thiserror::Error;

#[derive(Error, Debug)]
pub enum HtrError {
    #[error("Cancelled by user")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limit exceeded, retry after {retry_after:?} seconds")]
    RateLimit { retry_after: Option<u64> },

    #[error("Service error: {0}")]
    Service(String),

    #[error("Corrupted or unreadable content: {0}")]
    CorruptedContent(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HtrError {
    /// An auth failure is not item-specific: the adapter that raised it is
    /// disabled for the rest of the run.
    pub fn is_auth(&self) -> bool {
        matches!(self, HtrError::Auth(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, HtrError::RateLimit { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HtrError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, HtrError>;
