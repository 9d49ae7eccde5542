// Session and wire types

use serde::{Deserialize, Serialize};

/// Derived authentication status of the running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No access token held
    Unauthenticated,

    /// Startup is still reading storage or refreshing
    Authenticating,

    /// An access token is held and has not been cleared
    Authenticated,
}

/// State published to session observers.
///
/// `version` grows by one per committed change, so observers can tell a
/// refresh (same status, new version) from no change at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub version: u64,
}

/// In-memory credential record, owned by the session manager
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,

    /// Bumped on every identity change (sign-in, sign-out)
    pub epoch: u64,

    /// True while `initialize` has not settled
    pub initializing: bool,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        if self.initializing {
            SessionStatus::Authenticating
        } else if self.access_token.is_some() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Unauthenticated
        }
    }
}

/// Token data from a successful refresh
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub access_token: String,

    /// Present only when the server rotated the refresh token
    pub refresh_token: Option<String>,
}

/// Refresh request body
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response body
#[derive(Deserialize)]
pub struct RefreshResponse {
    #[serde(default, alias = "accessToken")]
    pub access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login response body.
///
/// The backend answers either flat `{token, refreshToken}` or nested
/// `{data: {token, refreshToken}}`; both are accepted.
#[derive(Deserialize, Default)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: LoginTokens,
    #[serde(default)]
    pub data: Option<LoginTokens>,
}

#[derive(Deserialize, Default)]
pub struct LoginTokens {
    #[serde(default, alias = "accessToken", alias = "access_token")]
    pub token: Option<String>,
    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<serde_json::Value>,
}

/// Credentials extracted from a login response
#[derive(Debug, Clone, PartialEq)]
pub struct LoginCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<serde_json::Value>,
}

impl LoginResponse {
    /// Pick the access token from whichever shape the server used.
    /// Flat fields win over nested ones when both are present.
    pub fn into_credentials(self) -> Option<LoginCredentials> {
        let nested = self.data.unwrap_or_default();
        let access_token = non_empty(self.tokens.token).or_else(|| non_empty(nested.token))?;

        Some(LoginCredentials {
            access_token,
            refresh_token: non_empty(self.tokens.refresh_token)
                .or_else(|| non_empty(nested.refresh_token)),
            user: self.tokens.user.or(nested.user),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Shorten a token for logging
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}
