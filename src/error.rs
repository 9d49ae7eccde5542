// Error handling module
// Defines the session error taxonomy surfaced to callers

use thiserror::Error;

/// Errors returned by the session manager and the authorized client
#[derive(Error, Debug)]
pub enum SessionError {
    /// Sign-in attempted without a usable access token, or the login
    /// endpoint rejected the supplied credentials
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Transport-level failure on the original request (timeout, DNS, offline)
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    /// Refresh failed, or a request was rejected again after a refresh.
    /// The session has been signed out by the time this is returned.
    #[error("Session expired")]
    SessionExpired {
        #[source]
        cause: Option<RefreshError>,
    },

    /// Non-success response from the backend
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request URL could not be built from the configured base URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable token store failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Whether the caller should send the user back to the login screen
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired { .. } | SessionError::InvalidCredentials(_)
        )
    }
}

/// Outcome of a failed refresh.
///
/// Cloneable because a single refresh result is handed to every caller
/// that joined the in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// Nothing stored to refresh from
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Refresh call could not reach the backend
    #[error("Refresh request failed: {0}")]
    Network(String),

    /// Refresh endpoint answered with a non-success status
    #[error("Refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Refresh endpoint answered 2xx without a usable access token
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Refreshed token could not be persisted
    #[error("Failed to persist refreshed token: {0}")]
    Storage(String),

    /// The signed-in identity changed while the refresh was in flight
    #[error("Session changed while refresh was in flight")]
    Superseded,
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
