use thiserror::Error;

/// Result type for gatekeeper construction and configuration
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Errors raised while building or reconfiguring the middleware
#[derive(Error, Debug)]
pub enum GatekeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors produced by a [`TokenValidator`](crate::validator::TokenValidator)
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("{0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token carries no subject")]
    MissingSubject,

    #[error("{0}")]
    Rejected(String),
}

/// Authentication failures. All of them are terminal for the call.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing metadata")]
    MissingMetadata,

    #[error("missing authorization header")]
    MissingCredential,

    #[error("invalid authorization format")]
    MalformedCredential,

    #[error("invalid token for {method}: {source}")]
    InvalidToken {
        method: String,
        #[source]
        source: TokenError,
    },
}

impl AuthError {
    /// Short label used for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingMetadata => "missing_metadata",
            AuthError::MissingCredential => "missing_credential",
            AuthError::MalformedCredential => "malformed_credential",
            AuthError::InvalidToken { .. } => "invalid_token",
        }
    }
}

impl From<&AuthError> for tonic::Status {
    fn from(err: &AuthError) -> Self {
        tonic::Status::unauthenticated(err.to_string())
    }
}

impl From<AuthError> for tonic::Status {
    fn from(err: AuthError) -> Self {
        tonic::Status::from(&err)
    }
}

/// Admission failures, one per limiter tier plus the missing identity case
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("global rate limit exceeded")]
    GlobalRateLimitExceeded,

    #[error("method rate limit exceeded for {method}")]
    MethodRateLimitExceeded { method: String },

    #[error("per-caller rate limit exceeded")]
    CallerRateLimitExceeded { caller: String },

    #[error("caller identity is required")]
    MissingIdentity,
}

impl AdmissionError {
    /// Limiter tier that rejected the call
    pub fn tier(&self) -> &'static str {
        match self {
            AdmissionError::GlobalRateLimitExceeded => "global",
            AdmissionError::MethodRateLimitExceeded { .. } => "method",
            AdmissionError::CallerRateLimitExceeded { .. } => "caller",
            AdmissionError::MissingIdentity => "identity",
        }
    }
}

impl From<&AdmissionError> for tonic::Status {
    fn from(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::MissingIdentity => tonic::Status::invalid_argument(err.to_string()),
            _ => tonic::Status::resource_exhausted(err.to_string()),
        }
    }
}

impl From<AdmissionError> for tonic::Status {
    fn from(err: AdmissionError) -> Self {
        tonic::Status::from(&err)
    }
}
