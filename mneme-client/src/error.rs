use std::fmt;

/// Errors that can occur while talking to the backend
#[derive(Debug)]
pub enum ApiError {
    /// Connection-level failure (DNS, refused, TLS, mid-body drop)
    Transport(reqwest::Error),

    /// The server answered with a non-success status
    Status { status: u16, body: String },

    /// The response body did not match the expected schema
    Decode(serde_json::Error),
}

impl ApiError {
    /// True for errors worth retrying from scratch (nothing was received).
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport(err) => write!(f, "Transport error: {}", err),
            ApiError::Status { status, body } => {
                write!(f, "Request failed with status {}: {}", status, body)
            }
            ApiError::Decode(err) => write!(f, "Failed to decode response: {}", err),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Transport(err) => Some(err),
            ApiError::Decode(err) => Some(err),
            ApiError::Status { .. } => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err)
    }
}
