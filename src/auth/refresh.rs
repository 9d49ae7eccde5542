// Token endpoint calls: refresh and login

use reqwest::{Client, StatusCode, Url};

use super::types::{
    token_preview, LoginCredentials, LoginRequest, LoginResponse, RefreshRequest, RefreshResponse,
    TokenData,
};
use crate::error::{RefreshError, SessionError};

/// Exchange a refresh token for a new access token.
///
/// Nothing is persisted here; the caller commits the result only after it
/// has been fully validated.
pub async fn refresh_access_token(
    client: &Client,
    url: &Url,
    refresh_token: &str,
) -> Result<TokenData, RefreshError> {
    tracing::info!(
        refresh_token = %token_preview(refresh_token),
        "Refreshing access token..."
    );

    let response = client
        .post(url.clone())
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, url = %url, "Refresh request could not be sent");
            RefreshError::Network(e.to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Token refresh rejected"
        );
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: error_text,
        });
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

    let access_token = data
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            RefreshError::InvalidResponse("response does not contain access_token".to_string())
        })?;

    // An omitted or empty refresh token means the old one stays valid
    let refresh_token = data.refresh_token.filter(|t| !t.is_empty());

    tracing::info!(
        rotated = refresh_token.is_some(),
        "Access token refreshed"
    );

    Ok(TokenData {
        access_token,
        refresh_token,
    })
}

/// Exchange email and password for session credentials
pub async fn login(
    client: &Client,
    url: &Url,
    email: &str,
    password: &str,
) -> Result<LoginCredentials, SessionError> {
    tracing::info!(email = %email, "Logging in...");

    let response = client
        .post(url.clone())
        .json(&LoginRequest { email, password })
        .send()
        .await
        .map_err(SessionError::Network)?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), body = %error_text, "Login rejected");

        return Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                SessionError::InvalidCredentials(login_error_message(&error_text))
            }
            _ => SessionError::Api {
                status: status.as_u16(),
                message: error_text,
            },
        });
    }

    let body: LoginResponse = response
        .json()
        .await
        .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

    body.into_credentials().ok_or_else(|| {
        SessionError::InvalidCredentials("login response does not contain a token".to_string())
    })
}

/// Pull a human-readable message out of a login error body
fn login_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "email or password rejected".to_string())
}
