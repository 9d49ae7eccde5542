use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{self, AccessSnapshot, SessionManager, TokenStore};
use crate::config::Config;
use crate::error::{Result, SessionError};

/// Per-request options for `ApiClient::authorized_request`
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// JSON body
    pub body: Option<serde_json::Value>,

    /// Query string pairs
    pub query: Vec<(String, String)>,

    /// Extra headers. Any Authorization header here is replaced by the
    /// session's bearer token.
    pub headers: HeaderMap,

    /// Overrides the client-wide request timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options carrying a serialized JSON body
    pub fn json<B: Serialize + ?Sized>(body: &B) -> Result<Self> {
        let body =
            serde_json::to_value(body).map_err(|e| SessionError::InvalidResponse(e.to_string()))?;
        Ok(Self {
            body: Some(body),
            ..Self::default()
        })
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Build the shared HTTP client with connection pooling and timeouts
pub fn build_http_client(connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .user_agent(concat!("catalog-session/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// Resolve a path against the base URL. Absolute URLs pass through.
pub fn join_url(base: &Url, path: &str) -> Result<Url> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    Url::parse(&raw).map_err(|e| SessionError::InvalidUrl(format!("{}: {}", raw, e)))
}

/// Managed client for the catalog backend.
///
/// Every call goes through `authorized_request`, which attaches the current
/// bearer token and recovers from an expired token once per request.
#[derive(Clone)]
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session whose credentials are attached
    session: SessionManager,

    /// Backend base URL, resolved once at startup
    base_url: Url,

    /// Login endpoint
    login_url: Url,
}

impl ApiClient {
    pub fn new(
        client: Client,
        session: SessionManager,
        base_url: Url,
        login_path: &str,
    ) -> Result<Self> {
        let login_url = join_url(&base_url, login_path)?;
        Ok(Self {
            client,
            session,
            base_url,
            login_url,
        })
    }

    /// Wire a client and its session manager from configuration
    pub fn from_config(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let base_url = Url::parse(&config.api_base_url)
            .map_err(|e| SessionError::InvalidUrl(format!("{}: {}", config.api_base_url, e)))?;
        let refresh_url = join_url(&base_url, &config.refresh_path)?;

        let client = build_http_client(config.http_connect_timeout, config.http_request_timeout)
            .map_err(|e| SessionError::Config(format!("{:#}", e)))?;
        let session = SessionManager::new(store, client.clone(), refresh_url);

        Self::new(client, session, base_url, &config.login_path)
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Log in with email and password and start a session
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let creds = auth::login(&self.client, &self.login_url, email, password).await?;
        self.session
            .sign_in_with_profile(
                &creds.access_token,
                creds.refresh_token.as_deref(),
                creds.user.as_ref(),
            )
            .await
    }

    /// Issue a request with the session's credentials.
    ///
    /// A 401 triggers one shared refresh and one re-issue of the same
    /// request. Other statuses are returned to the caller untouched.
    pub async fn authorized_request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        let url = join_url(&self.base_url, path)?;
        let mut access = self.session.access_snapshot().await;
        let mut retried = false;

        loop {
            tracing::debug!(method = %method, url = %url, retried, "Sending HTTP request");

            let response = self
                .build_request(&method, &url, &options, access.token.as_deref())
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(
                        error_kind = error_kind(&e),
                        error = %e,
                        url = %url,
                        "HTTP request error"
                    );
                    SessionError::Network(e)
                })?;

            let status = response.status();
            if status != StatusCode::UNAUTHORIZED {
                tracing::debug!(status = %status, "Received HTTP response");
                return Ok(response);
            }

            if retried {
                tracing::warn!(url = %url, "Request rejected again after token refresh");
                self.end_session(access.epoch).await;
                return Err(SessionError::SessionExpired { cause: None });
            }
            retried = true;

            tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");
            match self
                .session
                .refresh_rejected(access.token.clone(), access.epoch)
                .await
            {
                Ok(refreshed) => {
                    access = AccessSnapshot {
                        token: Some(refreshed.token),
                        epoch: refreshed.epoch,
                    };
                }
                Err(cause) => {
                    tracing::error!(error = %cause, "Token refresh failed");
                    self.end_session(access.epoch).await;
                    return Err(SessionError::SessionExpired { cause: Some(cause) });
                }
            }
        }
    }

    /// Convenience form of `authorized_request` with an optional JSON body
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let options = RequestOptions {
            body,
            ..RequestOptions::default()
        };
        self.authorized_request(method, path, options).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(Method::GET, path, RequestOptions::default())
            .await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::POST, path, RequestOptions::json(body)?)
            .await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(Method::PUT, path, RequestOptions::json(body)?)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .authorized_request(Method::DELETE, path, RequestOptions::default())
            .await?;
        ensure_success(response).await.map(|_| ())
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let response = self.authorized_request(method, path, options).await?;
        let response = ensure_success(response).await?;
        response
            .json()
            .await
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))
    }

    /// Fresh request with headers derived from the given token only
    fn build_request(
        &self,
        method: &Method,
        url: &Url,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> RequestBuilder {
        let mut headers = options.headers.clone();
        headers.remove(AUTHORIZATION);

        let mut builder = self.client.request(method.clone(), url.clone()).headers(headers);
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Forced sign-out after an unrecoverable 401
    async fn end_session(&self, epoch: u64) {
        if let Err(e) = self.session.expire(epoch).await {
            tracing::error!("Failed to clear expired session: {}", e);
        }
    }
}

/// Turn a non-success response into `SessionError::Api`
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let error_text = response.text().await.unwrap_or_default();
    tracing::error!(
        status = status.as_u16(),
        url = %url,
        response_body = %error_text,
        "HTTP request failed with error response"
    );
    Err(SessionError::Api {
        status: status.as_u16(),
        message: error_text,
    })
}

/// Categorize a transport error for logging
fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
