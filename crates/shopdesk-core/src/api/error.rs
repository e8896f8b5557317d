use thiserror::Error;

/// Failure of a single request, as stored in a rejected cache entry.
///
/// Every variant is `Clone` so one outcome can be handed to all awaiters of
/// a deduplicated request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized - session expired")]
    AuthExpired,

    #[error("Stored data unreadable: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl QueryError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => QueryError::AuthExpired,
            code => QueryError::Server {
                status: code,
                message: Self::truncate_body(body),
            },
        }
    }

    /// Whether this failure came back from the server rather than the transport.
    pub fn is_server(&self) -> bool {
        matches!(self, QueryError::Server { .. } | QueryError::AuthExpired)
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            QueryError::InvalidResponse(err.to_string())
        } else {
            QueryError::Network(err.to_string())
        }
    }
}

/// Rejection of a malformed endpoint declaration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint name must not be empty")]
    EmptyName,

    #[error("Endpoint {endpoint}: path must start with '/': {path}")]
    RelativePath { endpoint: String, path: String },

    #[error("Endpoint {endpoint}: malformed path template {path}")]
    MalformedTemplate { endpoint: String, path: String },

    #[error("Endpoint {endpoint}: placeholder {{{name}}} appears twice")]
    DuplicatePlaceholder { endpoint: String, name: String },

    #[error("Endpoint {endpoint}: queries must use GET")]
    QueryMethod { endpoint: String },

    #[error("Endpoint {endpoint}: queries cannot invalidate tags")]
    QueryInvalidates { endpoint: String },

    #[error("Endpoint {endpoint}: tag kind must not be empty")]
    EmptyTagKind { endpoint: String },
}
