use thiserror::Error;

/// Error type shared by every Carebridge gateway and the client pool.
///
/// Each variant maps to a stable wire kind and an HTTP status so that the
/// failure body a caller sees is identical no matter which protocol surface
/// produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    #[error("Not registered: {0}")]
    NotRegistered(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("Update failed: {0}")]
    UpdateFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a new AuthenticationFailed error
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(message.into())
    }

    /// Create a new NotFound error
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Create a new NotRegistered error
    pub fn not_registered(message: impl Into<String>) -> Self {
        Self::NotRegistered(message.into())
    }

    /// Create a new Conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a new RequestTimeout error
    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::RequestTimeout(message.into())
    }

    /// Create a new Upstream error
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Create a new InvalidResponse error
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Create a new UpdateFailed error
    pub fn update_failed(message: impl Into<String>) -> Self {
        Self::UpdateFailed(message.into())
    }

    /// Create a new Cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable wire identifier used in failure response bodies and event
    /// payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotRegistered(_) => ErrorKind::NotRegistered,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::RequestTimeout(_) => ErrorKind::RequestTimeout,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::UpdateFailed(_) => ErrorKind::UpdateFailed,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status this error surfaces as at a gateway boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound { .. } | Self::NotRegistered(_) => 404,
            Self::Conflict(_) => 409,
            Self::Cancelled(_) => 499,
            Self::Internal(_) => 500,
            Self::AuthenticationFailed(_)
            | Self::Upstream { .. }
            | Self::InvalidResponse(_)
            | Self::UpdateFailed(_) => 502,
            Self::RequestTimeout(_) => 504,
        }
    }

    /// Check if this error is a client error (4xx category)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Check if this error is a server error (5xx category)
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Wire-level error kinds, one per `Error` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AuthenticationFailed,
    NotFound,
    NotRegistered,
    Conflict,
    RequestTimeout,
    Upstream,
    InvalidResponse,
    UpdateFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgumentError",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::NotFound => "NotFoundError",
            Self::NotRegistered => "NotRegisteredError",
            Self::Conflict => "ConflictError",
            Self::RequestTimeout => "RequestTimeout",
            Self::Upstream => "UpstreamError",
            Self::InvalidResponse => "InvalidResponseError",
            Self::UpdateFailed => "UpdateFailed",
            Self::Cancelled => "CancelledError",
            Self::Internal => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Convenience result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;
