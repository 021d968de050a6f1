//! HTTP error types

use thiserror::Error;

/// Failure of one logical HTTP request (after retries)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("No network connectivity")]
    Offline,

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Unauthorized (HTTP 401) from {url}")]
    Unauthorized { url: String },

    #[error("Rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl HttpError {
    /// Status codes that mean "slow down" rather than "broken"
    pub fn should_back_off(&self) -> bool {
        match self {
            HttpError::RateLimited { .. } => true,
            HttpError::Status { status, .. } => matches!(status, 419 | 429 | 503),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Unauthorized { .. } => Some(401),
            HttpError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_off_classes() {
        let url = "https://example.com".to_string();
        for status in [419, 429, 503] {
            assert!(HttpError::Status { status, url: url.clone() }.should_back_off());
        }
        assert!(!HttpError::Status { status: 500, url: url.clone() }.should_back_off());
        assert!(HttpError::RateLimited { url: url.clone(), attempts: 6 }.should_back_off());
        assert!(!HttpError::Unauthorized { url }.should_back_off());
    }
}
