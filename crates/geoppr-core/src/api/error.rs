use reqwest::StatusCode;
use thiserror::Error;

/// A failed call to one API endpoint. Every variant names the URL so a
/// failed fetch can be traced back to its collection.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{url} not found: {body}")]
    NotFound { url: String, body: String },

    #[error("{url} refused the request ({status}): {body}")]
    Refused {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("{url} still rate limited after {retries} retries")]
    RateLimited { url: String, retries: u32 },

    #[error("{url} failed ({status}): {body}")]
    ServerError {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("Could not reach {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Error for a non-success answer from `url`. 429 is handled by the
    /// retry loop and never gets here.
    pub fn from_status(url: &str, status: StatusCode, body: &str) -> Self {
        let url = url.to_string();
        let body = Self::truncate_body(body);
        match status.as_u16() {
            404 => ApiError::NotFound { url, body },
            500..=599 => ApiError::ServerError { url, status, body },
            _ => ApiError::Refused { url, status, body },
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ApiError::NotFound { url, .. }
            | ApiError::Refused { url, .. }
            | ApiError::RateLimited { url, .. }
            | ApiError::ServerError { url, .. }
            | ApiError::Network { url, .. } => url,
        }
    }

    /// Response body, for errors the server answered.
    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::NotFound { body, .. }
            | ApiError::Refused { body, .. }
            | ApiError::ServerError { body, .. } => Some(body),
            ApiError::RateLimited { .. } | ApiError::Network { .. } => None,
        }
    }
}
