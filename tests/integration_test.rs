// Integration tests for the catalog session client
//
// These tests run the managed client against a local mock backend and
// verify token refresh coordination end to end.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use catalog_session::{
    auth::{MemoryTokenStore, SqliteTokenStore, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY},
    config::{Config, LogFormat},
    http_client::ApiClient,
    RefreshError, SessionError, SessionStatus,
};

// ==================================================================================================
// Mock Backend
// ==================================================================================================

struct Backend {
    /// Token the protected endpoints currently accept
    valid_token: Mutex<String>,

    /// Token handed out by the refresh endpoint
    issued_token: String,

    /// Refresh token the refresh endpoint accepts
    accepted_refresh_token: String,

    refresh_succeeds: bool,
    refresh_delay: Duration,
    refresh_calls: AtomicUsize,
    protected_calls: AtomicUsize,
}

impl Backend {
    fn new(valid_token: &str, refresh_succeeds: bool, refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            valid_token: Mutex::new(valid_token.to_string()),
            issued_token: "fresh-token".to_string(),
            accepted_refresh_token: "R".to_string(),
            refresh_succeeds,
            refresh_delay,
            refresh_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
        })
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

async fn handle_spaces(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    backend.protected_calls.fetch_add(1, Ordering::SeqCst);
    let expected = format!("Bearer {}", backend.valid_token.lock().unwrap());

    match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(value) if value == expected => Ok(Json(json!([
            {"id": 1, "name": "Kitchen"},
            {"id": 2, "name": "Garage"}
        ]))),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Slow endpoint that answers with data owned by the caller's token
async fn handle_orders(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    tokio::time::sleep(Duration::from_millis(300)).await;

    match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some("Bearer user-b-token") => Ok(Json(json!({"owner": "B"}))),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn handle_refresh(
    State(backend): State<Arc<Backend>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(backend.refresh_delay).await;

    let presented = body["refresh_token"].as_str().unwrap_or_default();
    if !backend.refresh_succeeds || presented != backend.accepted_refresh_token {
        return Err((StatusCode::UNAUTHORIZED, "invalid refresh token".to_string()));
    }

    *backend.valid_token.lock().unwrap() = backend.issued_token.clone();
    Ok(Json(json!({"access_token": backend.issued_token})))
}

async fn handle_login(
    State(backend): State<Arc<Backend>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body["password"] != "correct horse" {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid email or password"})),
        ));
    }

    let token = backend.valid_token.lock().unwrap().clone();
    Ok(Json(json!({
        "success": true,
        "data": {
            "token": token,
            "refreshToken": backend.accepted_refresh_token,
            "user": {"id": 42, "email": body["email"]}
        }
    })))
}

/// Start the mock backend and return its base URL
async fn start_backend(backend: Arc<Backend>) -> String {
    let app = Router::new()
        .route("/spaces", get(handle_spaces))
        .route("/orders", get(handle_orders))
        .route("/auth/refresh-token", post(handle_refresh))
        .route("/auth/login", post(handle_login))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{}", addr)
}

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn test_config(base_url: &str, db_file: PathBuf) -> Config {
    Config {
        api_base_url: base_url.to_string(),
        login_path: "/auth/login".to_string(),
        refresh_path: "/auth/refresh-token".to_string(),
        session_db_file: db_file,
        http_connect_timeout: 5,
        http_request_timeout: 10,
        log_level: "debug".to_string(),
        log_format: LogFormat::Text,
    }
}

fn temp_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "catalog-session-it-{}-{}.sqlite3",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

async fn signed_in_client(base_url: &str, access_token: &str) -> (ApiClient, Arc<MemoryTokenStore>) {
    let store = Arc::new(MemoryTokenStore::new());
    let api = ApiClient::from_config(&test_config(base_url, temp_db("unused")), store.clone())
        .expect("Failed to create API client");
    api.session().sign_in(access_token, Some("R")).await.unwrap();
    (api, store)
}

async fn fetch_concurrently(api: &ApiClient, count: usize) -> Vec<Result<Value, SessionError>> {
    let handles: Vec<_> = (0..count)
        .map(|_| {
            let api = api.clone();
            tokio::spawn(async move { api.get_json::<Value>("/spaces").await })
        })
        .collect();

    let mut results = Vec::with_capacity(count);
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

// ==================================================================================================
// Refresh Coordination Tests
// ==================================================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let backend = Backend::new("server-side-token", true, Duration::from_millis(200));
    let base_url = start_backend(backend.clone()).await;
    let (api, store) = signed_in_client(&base_url, "stale-token").await;

    let results = fetch_concurrently(&api, 8).await;

    for result in &results {
        let spaces = result.as_ref().expect("every request should succeed");
        assert_eq!(spaces[0]["name"], "Kitchen");
    }
    assert_eq!(backend.refresh_calls(), 1);
    assert!(api.session().is_authenticated());

    let stored = store.snapshot();
    assert_eq!(stored.get(ACCESS_TOKEN_KEY).map(String::as_str), Some("fresh-token"));
    assert_eq!(stored.get(REFRESH_TOKEN_KEY).map(String::as_str), Some("R"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_all_fail_when_refresh_fails() {
    let backend = Backend::new("server-side-token", false, Duration::from_millis(200));
    let base_url = start_backend(backend.clone()).await;
    let (api, store) = signed_in_client(&base_url, "stale-token").await;

    let results = fetch_concurrently(&api, 8).await;

    for result in results {
        match result {
            Err(SessionError::SessionExpired { .. }) => {}
            other => panic!("expected SessionExpired, got {other:?}"),
        }
    }
    assert_eq!(backend.refresh_calls(), 1);
    assert!(!api.session().is_authenticated());
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn test_valid_token_makes_no_refresh_call() {
    let backend = Backend::new("good-token", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let (api, _) = signed_in_client(&base_url, "good-token").await;

    let spaces: Value = api.get_json("/spaces").await.unwrap();

    assert_eq!(spaces.as_array().map(Vec::len), Some(2));
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(backend.protected_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sign_out_during_refresh_is_not_reverted() {
    let backend = Backend::new("server-side-token", true, Duration::from_millis(300));
    let base_url = start_backend(backend.clone()).await;
    let (api, store) = signed_in_client(&base_url, "stale-token").await;
    let mut observer = api.session().subscribe();

    let request = {
        let api = api.clone();
        tokio::spawn(async move { api.get_json::<Value>("/spaces").await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    api.session().sign_out().await.unwrap();

    let result = request.await.unwrap();
    match result {
        Err(SessionError::SessionExpired { cause }) => {
            assert_eq!(cause, Some(RefreshError::Superseded))
        }
        other => panic!("expected SessionExpired, got {other:?}"),
    }

    assert!(!api.session().is_authenticated());
    assert!(store.snapshot().is_empty());
    assert_eq!(observer.borrow_and_update().status, SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn test_sign_in_during_refresh_survives_late_failure() {
    let backend = Backend::new("server-side-token", true, Duration::from_millis(300));
    let base_url = start_backend(backend.clone()).await;
    let (api, store) = signed_in_client(&base_url, "stale-token").await;

    let request = {
        let api = api.clone();
        tokio::spawn(async move { api.get_json::<Value>("/spaces").await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    api.session().sign_out().await.unwrap();
    api.session().sign_in("second-user-token", Some("R2")).await.unwrap();

    let result = request.await.unwrap();
    assert!(matches!(result, Err(SessionError::SessionExpired { .. })));

    // The newer sign-in is left untouched
    assert!(api.session().is_authenticated());
    let stored = store.snapshot();
    assert_eq!(
        stored.get(ACCESS_TOKEN_KEY).map(String::as_str),
        Some("second-user-token")
    );
    assert_eq!(stored.get(REFRESH_TOKEN_KEY).map(String::as_str), Some("R2"));
}

#[tokio::test]
async fn test_late_401_is_not_replayed_with_next_users_token() {
    let backend = Backend::new("server-side-token", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let (api, store) = signed_in_client(&base_url, "user-a-token").await;

    let request = {
        let api = api.clone();
        tokio::spawn(async move { api.get_json::<Value>("/orders").await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    api.session().sign_out().await.unwrap();
    api.session().sign_in("user-b-token", Some("RB")).await.unwrap();

    let result = request.await.unwrap();
    match result {
        Err(SessionError::SessionExpired { cause }) => {
            assert_eq!(cause, Some(RefreshError::Superseded))
        }
        other => panic!("expected SessionExpired, got {other:?}"),
    }
    assert_eq!(backend.refresh_calls(), 0);

    // The second user stays signed in
    assert!(api.session().is_authenticated());
    let stored = store.snapshot();
    assert_eq!(
        stored.get(ACCESS_TOKEN_KEY).map(String::as_str),
        Some("user-b-token")
    );
    assert_eq!(stored.get(REFRESH_TOKEN_KEY).map(String::as_str), Some("RB"));
}

#[tokio::test]
async fn test_observers_are_notified_of_refresh() {
    let backend = Backend::new("server-side-token", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let (api, _) = signed_in_client(&base_url, "stale-token").await;

    let mut observer = api.session().subscribe();
    let before = observer.borrow_and_update().version;

    let _: Value = api.get_json("/spaces").await.unwrap();

    assert!(observer.has_changed().unwrap());
    let after = *observer.borrow_and_update();
    assert_eq!(after.status, SessionStatus::Authenticated);
    assert!(after.version > before);
}

// ==================================================================================================
// Startup And Login Tests
// ==================================================================================================

#[tokio::test]
async fn test_initialize_refreshes_from_persisted_refresh_token() {
    let backend = Backend::new("unused", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let db_file = temp_db("startup-ok");

    {
        let store = SqliteTokenStore::open(&db_file).unwrap();
        store.set(REFRESH_TOKEN_KEY, "R").unwrap();
    }

    let store = Arc::new(SqliteTokenStore::open(&db_file).unwrap());
    let api = ApiClient::from_config(&test_config(&base_url, db_file.clone()), store).unwrap();

    let status = api.session().initialize().await.unwrap();

    assert_eq!(status, SessionStatus::Authenticated);
    assert!(api.session().is_authenticated());
    assert_eq!(backend.refresh_calls(), 1);

    let reopened = SqliteTokenStore::open(&db_file).unwrap();
    assert_eq!(
        reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
        Some("fresh-token")
    );
    assert_eq!(reopened.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R"));

    let _ = std::fs::remove_file(&db_file);
}

#[tokio::test]
async fn test_initialize_clears_persisted_session_when_refresh_fails() {
    let backend = Backend::new("unused", false, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let db_file = temp_db("startup-fail");

    let store = Arc::new(SqliteTokenStore::open(&db_file).unwrap());
    store.set(REFRESH_TOKEN_KEY, "R").unwrap();
    let api = ApiClient::from_config(&test_config(&base_url, db_file.clone()), store.clone())
        .unwrap();

    let status = api.session().initialize().await.unwrap();

    assert_eq!(status, SessionStatus::Unauthenticated);
    assert!(!api.session().is_initializing());
    assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);

    let _ = std::fs::remove_file(&db_file);
}

#[tokio::test]
async fn test_initialize_without_tokens_makes_no_network_call() {
    let backend = Backend::new("unused", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;

    let api = ApiClient::from_config(
        &test_config(&base_url, temp_db("unused")),
        Arc::new(MemoryTokenStore::new()),
    )
    .unwrap();

    let status = api.session().initialize().await.unwrap();

    assert_eq!(status, SessionStatus::Unauthenticated);
    assert_eq!(backend.refresh_calls(), 0);
}

#[tokio::test]
async fn test_login_then_fetch() {
    let backend = Backend::new("issued-at-login", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let store = Arc::new(MemoryTokenStore::new());
    let api = ApiClient::from_config(&test_config(&base_url, temp_db("unused")), store.clone())
        .unwrap();

    api.login("ana@example.com", "correct horse").await.unwrap();
    let spaces: Value = api.get_json("/spaces").await.unwrap();

    assert_eq!(spaces[1]["name"], "Garage");
    assert_eq!(
        api.session().cached_profile().unwrap(),
        Some(json!({"id": 42, "email": "ana@example.com"}))
    );
    let stored = store.snapshot();
    assert_eq!(
        stored.get(ACCESS_TOKEN_KEY).map(String::as_str),
        Some("issued-at-login")
    );
    assert_eq!(stored.get(REFRESH_TOKEN_KEY).map(String::as_str), Some("R"));
}

#[tokio::test]
async fn test_login_with_wrong_password() {
    let backend = Backend::new("issued-at-login", true, Duration::ZERO);
    let base_url = start_backend(backend.clone()).await;
    let store = Arc::new(MemoryTokenStore::new());
    let api = ApiClient::from_config(&test_config(&base_url, temp_db("unused")), store.clone())
        .unwrap();

    let err = api.login("ana@example.com", "wrong").await.unwrap_err();

    match err {
        SessionError::InvalidCredentials(message) => {
            assert_eq!(message, "Invalid email or password")
        }
        other => panic!("expected InvalidCredentials, got {other:?}"),
    }
    assert!(!api.session().is_authenticated());
    assert!(store.snapshot().is_empty());
}
