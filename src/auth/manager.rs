use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, RwLock};

use super::refresh;
use super::store::{TokenStore, ACCESS_TOKEN_KEY, PROFILE_KEYS, REFRESH_TOKEN_KEY, USER_PROFILE_KEY};
use super::types::{token_preview, Session, SessionSnapshot, SessionStatus, TokenData};
use crate::error::{RefreshError, Result, SessionError};

type RefreshFuture = BoxFuture<'static, std::result::Result<RefreshedToken, RefreshError>>;

/// The refresh currently in flight.
///
/// Held weakly so that a refresh abandoned by every waiter is dropped
/// instead of being resumed by the next caller.
struct PendingRefresh {
    id: u64,

    /// Identity generation the refresh belongs to. Callers from another
    /// generation never join it.
    epoch: u64,

    future: WeakShared<RefreshFuture>,
}

/// Why a refresh was started
enum RefreshReason {
    /// Explicit call, always hits the refresh endpoint
    Requested,

    /// The server refused this access token
    Rejected(Option<String>),
}

/// Token produced by a refresh, with the generation it was committed under
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RefreshedToken {
    pub token: String,
    pub epoch: u64,
}

/// Access token as seen by a request at send time
#[derive(Debug, Clone)]
pub(crate) struct AccessSnapshot {
    pub token: Option<String>,
    pub epoch: u64,
}

/// Session manager
/// Single authority over the stored credentials, the refresh endpoint and
/// session notifications. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    /// Durable token storage
    store: Arc<dyn TokenStore>,

    /// HTTP client for refresh requests
    client: Client,

    /// Refresh endpoint
    refresh_url: Url,

    /// In-memory session, the source of truth during a run
    session: RwLock<Session>,

    /// At most one refresh in flight
    pending: Mutex<Option<PendingRefresh>>,

    next_refresh_id: AtomicU64,

    /// Published on every committed change
    status_tx: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    /// Create a manager with an empty in-memory session.
    /// Call `initialize` to pick up persisted credentials.
    pub fn new(store: Arc<dyn TokenStore>, client: Client, refresh_url: Url) -> Self {
        let (status_tx, _) = watch::channel(SessionSnapshot {
            status: SessionStatus::Unauthenticated,
            version: 0,
        });

        Self {
            inner: Arc::new(Inner {
                store,
                client,
                refresh_url,
                session: RwLock::new(Session::default()),
                pending: Mutex::new(None),
                next_refresh_id: AtomicU64::new(1),
                status_tx,
            }),
        }
    }

    /// Restore the persisted session at startup.
    ///
    /// A stored access token is trusted as-is and validated lazily by the
    /// first request. With only a refresh token, one refresh is attempted
    /// and failure clears everything. Returns the settled status.
    pub async fn initialize(&self) -> Result<SessionStatus> {
        tracing::info!("Initializing session...");
        self.inner.set_initializing(true).await;

        let stored = self
            .inner
            .store
            .get(ACCESS_TOKEN_KEY)
            .and_then(|access| Ok((access, self.inner.store.get(REFRESH_TOKEN_KEY)?)));

        let (access_token, refresh_token) = match stored {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Failed to read stored credentials: {:#}", e);
                self.inner.set_initializing(false).await;
                return Err(SessionError::Storage(e));
            }
        };

        match (access_token, refresh_token) {
            (Some(access_token), refresh_token) => {
                let mut session = self.inner.session.write().await;
                tracing::info!(
                    token = %token_preview(&access_token),
                    "Restored stored session"
                );
                session.access_token = Some(access_token);
                session.refresh_token = refresh_token;
                session.initializing = false;
                self.inner.publish(&session);
            }
            (None, Some(refresh_token)) => {
                {
                    let mut session = self.inner.session.write().await;
                    session.refresh_token = Some(refresh_token);
                }

                let outcome = self.refresh().await;
                if let Err(e) = outcome {
                    tracing::warn!("Startup token refresh failed, clearing session: {}", e);
                    if let Err(e) = self.inner.clear(None).await {
                        self.inner.set_initializing(false).await;
                        return Err(e);
                    }
                }
                self.inner.set_initializing(false).await;
            }
            (None, None) => {
                tracing::info!("No stored session");
                self.inner.set_initializing(false).await;
            }
        }

        let status = self.status();
        tracing::info!(status = ?status, "Session initialized");
        Ok(status)
    }

    /// Persist freshly issued credentials and mark the session authenticated
    pub async fn sign_in(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        self.sign_in_with_profile(access_token, refresh_token, None)
            .await
    }

    /// Same as `sign_in`, also caching the user profile returned at login
    pub async fn sign_in_with_profile(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        profile: Option<&serde_json::Value>,
    ) -> Result<()> {
        if access_token.trim().is_empty() {
            return Err(SessionError::InvalidCredentials(
                "access token is empty".to_string(),
            ));
        }

        let refresh_token = refresh_token.filter(|t| !t.trim().is_empty());
        if refresh_token.is_none() {
            tracing::warn!("Signing in without a refresh token; expiry will end the session");
        }

        let profile = profile
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;

        let mut session = self.inner.session.write().await;
        self.inner.store.write_batch(&[
            (ACCESS_TOKEN_KEY, Some(access_token)),
            (REFRESH_TOKEN_KEY, refresh_token),
            (USER_PROFILE_KEY, profile.as_deref()),
        ])?;

        session.access_token = Some(access_token.to_string());
        session.refresh_token = refresh_token.map(str::to_string);
        session.epoch += 1;
        self.inner.publish(&session);

        tracing::info!(token = %token_preview(access_token), "Signed in");
        Ok(())
    }

    /// Clear stored and in-memory credentials. Safe to call when already
    /// signed out.
    pub async fn sign_out(&self) -> Result<()> {
        self.inner.clear(None).await
    }

    /// Sign out only if the session that expired is still the current one,
    /// so a late failure cannot undo a newer sign-in.
    pub(crate) async fn expire(&self, epoch: u64) -> Result<()> {
        self.inner.clear(Some(epoch)).await
    }

    /// Obtain a new access token, joining the in-flight refresh if there is
    /// one. Every caller that joins gets the same outcome.
    pub async fn refresh(&self) -> std::result::Result<String, RefreshError> {
        let epoch = self.inner.session.read().await.epoch;
        self.start_or_join_refresh(epoch, RefreshReason::Requested)
            .await
            .map(|refreshed| refreshed.token)
    }

    /// Refresh because the server refused `rejected`, which was sent under
    /// generation `epoch`. If the session has moved to another generation
    /// the refresh fails with `Superseded`. If it still holds a different
    /// token of the same generation, that token is returned without a
    /// network call.
    pub(crate) async fn refresh_rejected(
        &self,
        rejected: Option<String>,
        epoch: u64,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        let refreshed = self
            .start_or_join_refresh(epoch, RefreshReason::Rejected(rejected))
            .await?;

        if refreshed.epoch != epoch {
            return Err(RefreshError::Superseded);
        }
        Ok(refreshed)
    }

    async fn start_or_join_refresh(
        &self,
        epoch: u64,
        reason: RefreshReason,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        let future = {
            let mut slot = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let in_flight = slot
                .as_ref()
                .filter(|pending| pending.epoch == epoch)
                .and_then(|pending| pending.future.upgrade().map(|f| (pending.id, f)));

            match in_flight {
                Some((id, future)) => {
                    tracing::debug!(refresh_id = id, "Joining in-flight token refresh");
                    future
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let future: Shared<RefreshFuture> = async move {
                        let result = inner.perform_refresh(epoch, reason).await;
                        inner.finish_refresh(id);
                        result
                    }
                    .boxed()
                    .shared();

                    tracing::debug!(refresh_id = id, epoch, "Starting token refresh");
                    *slot = future
                        .downgrade()
                        .map(|weak| PendingRefresh {
                            id,
                            epoch,
                            future: weak,
                        });
                    future
                }
            }
        };

        future.await
    }

    /// Current access token and the identity generation it belongs to
    pub(crate) async fn access_snapshot(&self) -> AccessSnapshot {
        let session = self.inner.session.read().await;
        AccessSnapshot {
            token: session.access_token.clone(),
            epoch: session.epoch,
        }
    }

    /// Latest committed status
    pub fn status(&self) -> SessionStatus {
        self.inner.status_tx.borrow().status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    pub fn is_initializing(&self) -> bool {
        self.status() == SessionStatus::Authenticating
    }

    /// Receive every committed session change, in commit order
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// User profile cached at login, if any
    pub fn cached_profile(&self) -> Result<Option<serde_json::Value>> {
        match self.inner.store.get(USER_PROFILE_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SessionError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }
}

impl Inner {
    /// Publish the session state. Callers hold the session write guard, so
    /// notifications go out in commit order.
    fn publish(&self, session: &Session) {
        let status = session.status();
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.version += 1;
        });
    }

    async fn set_initializing(&self, initializing: bool) {
        let mut session = self.session.write().await;
        if session.initializing != initializing {
            session.initializing = initializing;
            self.publish(&session);
        }
    }

    async fn perform_refresh(
        &self,
        epoch: u64,
        reason: RefreshReason,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        let refresh_token = {
            let session = self.session.read().await;
            if session.epoch != epoch {
                tracing::debug!("Session changed before refresh started");
                return Err(RefreshError::Superseded);
            }

            if let RefreshReason::Rejected(rejected) = &reason {
                if let Some(current) = &session.access_token {
                    if Some(current) != rejected.as_ref() {
                        tracing::debug!("Rejected token already replaced, skipping refresh");
                        return Ok(RefreshedToken {
                            token: current.clone(),
                            epoch,
                        });
                    }
                }
            }

            session.refresh_token.clone()
        };

        let Some(refresh_token) = refresh_token else {
            tracing::warn!("Token refresh requested without a refresh token");
            return Err(RefreshError::NoRefreshToken);
        };

        let data =
            refresh::refresh_access_token(&self.client, &self.refresh_url, &refresh_token).await?;
        self.commit_refresh(epoch, data).await
    }

    /// Persist and apply a validated refresh result
    async fn commit_refresh(
        &self,
        epoch: u64,
        data: TokenData,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        let mut session = self.session.write().await;
        if session.epoch != epoch {
            tracing::warn!("Discarding refreshed token: session changed during refresh");
            return Err(RefreshError::Superseded);
        }

        let mut batch = vec![(ACCESS_TOKEN_KEY, Some(data.access_token.as_str()))];
        if let Some(rotated) = data.refresh_token.as_deref() {
            batch.push((REFRESH_TOKEN_KEY, Some(rotated)));
        }
        self.store
            .write_batch(&batch)
            .map_err(|e| RefreshError::Storage(format!("{:#}", e)))?;

        session.access_token = Some(data.access_token.clone());
        if let Some(rotated) = data.refresh_token {
            session.refresh_token = Some(rotated);
        }
        self.publish(&session);

        Ok(RefreshedToken {
            token: data.access_token,
            epoch: session.epoch,
        })
    }

    fn finish_refresh(&self, id: u64) {
        let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|pending| pending.id == id) {
            *slot = None;
        }
    }

    /// Remove credentials from storage and memory.
    ///
    /// With `expected_epoch`, only clears if that generation is still
    /// current. Memory is cleared even if the store write fails.
    async fn clear(&self, expected_epoch: Option<u64>) -> Result<()> {
        let mut session = self.session.write().await;
        if expected_epoch.is_some_and(|epoch| epoch != session.epoch) {
            tracing::debug!("Skipping sign-out of a session that was already replaced");
            return Ok(());
        }

        let mut batch: Vec<(&str, Option<&str>)> =
            vec![(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)];
        batch.extend(PROFILE_KEYS.iter().map(|key| (*key, None)));
        let stored = self.store.write_batch(&batch);

        if session.access_token.is_some() || session.refresh_token.is_some() {
            session.access_token = None;
            session.refresh_token = None;
            session.epoch += 1;
            self.publish(&session);
            tracing::info!("Signed out");
        }

        stored.map_err(|e| {
            tracing::error!("Failed to clear stored credentials: {:#}", e);
            SessionError::Storage(e)
        })
    }
}
