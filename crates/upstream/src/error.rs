use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: serde_json::Value,
    },

    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpstreamError {
    pub fn status(status: reqwest::StatusCode, body: serde_json::Value) -> Self {
        Self::Status { status, body }
    }
}
