//! API client for the back-office REST backend.
//!
//! `ApiClient` attaches the stored access token to outgoing requests. When a
//! request is rejected with `401`, it refreshes the token once and replays
//! the request. Concurrent expiries share one refresh call; a failed
//! refresh clears the stored session and broadcasts
//! [`SessionEvent::Invalidated`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{Credentials, SessionEvent, TokenPair, TokenStore, REFRESH_TOKEN_KEY};
use crate::config::{Config, RefreshTransport};

use super::request::{bearer_value, OutgoingRequest};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

pub const LOGIN_PATH: &str = "/auth/login";

pub const REFRESH_PATH: &str = "/auth/refresh";

/// Buffer size for the session event channel.
/// Events are rare (one per refresh), 16 leaves room for slow subscribers.
const EVENT_CHANNEL_SIZE: usize = 16;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    message: Option<String>,
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Only present if the backend rotates refresh tokens
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

type RefreshOutcome = Result<String, Arc<ApiError>>;

type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// API client for the back-office backend.
/// Clone is cheap - state is shared behind an Arc and reqwest pools connections.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base_url: String,
    store: Arc<dyn TokenStore>,
    refresh_transport: RefreshTransport,
    /// The refresh currently in flight, shared by every request waiting on it
    pending_refresh: Mutex<Option<PendingRefresh>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ApiClient {
    pub fn new(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|e| {
            ApiError::Configuration(format!(
                "Invalid API base URL {:?}: {}",
                config.api_base_url, e
            ))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .cookie_store(true)
            .build()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                store,
                refresh_transport: config.refresh_transport,
                pending_refresh: Mutex::new(None),
                events,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Durable storage the client reads tokens from
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.store
    }

    /// Receive token refresh and session invalidation notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!(?event, "No subscribers for session event");
        }
    }

    fn pending_refresh(&self) -> MutexGuard<'_, Option<PendingRefresh>> {
        self.inner
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Authentication =====

    /// Exchange credentials for a token pair.
    ///
    /// Sent without a bearer token, and a `401` here means bad credentials,
    /// so it never goes through the refresh path.
    pub async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError> {
        let response = self
            .inner
            .client
            .post(self.url(LOGIN_PATH))
            .header(header::ACCEPT, "application/json")
            .json(credentials)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let login: LoginResponse = Self::read_json(response).await?;

        if let Some(message) = login.message.as_deref() {
            debug!(message, "Login accepted");
        }

        Ok(TokenPair {
            access_token: login.access_token,
            refresh_token: login.refresh_token,
        })
    }

    /// Obtain a new access token, joining a refresh that is already in flight.
    ///
    /// On success the new token is stored. On failure both tokens are
    /// removed and [`SessionEvent::Invalidated`] is emitted, once per refresh
    /// regardless of how many callers were waiting on it.
    pub async fn refresh_access_token(&self) -> Result<String, ApiError> {
        let pending = {
            let mut slot = self.pending_refresh();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let pending = self.clone().run_refresh().boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(ApiError::RefreshFailed)
    }

    async fn run_refresh(self) -> RefreshOutcome {
        info!("Refreshing access token");

        let outcome = match self.request_refresh().await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, clearing stored session");
                if let Err(clear_err) = self.inner.store.clear_tokens() {
                    warn!(error = %clear_err, "Failed to clear stored tokens");
                }
                Err(Arc::new(e))
            }
        };

        // Storage is settled, later expiries may start a new refresh
        self.pending_refresh().take();

        match outcome {
            Ok(_) => self.emit(SessionEvent::TokenRefreshed),
            Err(_) => self.emit(SessionEvent::Invalidated),
        }
        outcome
    }

    async fn request_refresh(&self) -> Result<String, ApiError> {
        // Never carries a bearer token
        let mut request = self
            .inner
            .client
            .post(self.url(REFRESH_PATH))
            .header(header::ACCEPT, "application/json");

        if self.inner.refresh_transport == RefreshTransport::JsonBody {
            let refresh_token = self
                .inner
                .store
                .refresh_token()?
                .ok_or(ApiError::MissingRefreshToken)?;
            request = request.json(&RefreshRequest {
                refresh_token: &refresh_token,
            });
        }

        let response = Self::check_response(request.send().await?).await?;
        let refreshed: RefreshResponse = Self::read_json(response).await?;

        self.inner.store.set_access_token(&refreshed.access_token)?;
        if let Some(rotated) = refreshed.refresh_token.as_deref() {
            self.inner.store.set(REFRESH_TOKEN_KEY, rotated)?;
        }

        debug!("Access token refreshed");
        Ok(refreshed.access_token)
    }

    // ===== Request pipeline =====

    /// Send a request through the authentication pipeline.
    ///
    /// Successful responses are returned as-is. A `401` triggers at most one
    /// refresh-and-retry; every other failure status becomes an [`ApiError`]
    /// carrying the status and body.
    pub async fn send(&self, mut request: OutgoingRequest) -> Result<reqwest::Response, ApiError> {
        let (response, sent_token) = self.dispatch(&request).await?;

        if response.status() != StatusCode::UNAUTHORIZED || !Self::can_retry(&request) {
            return Self::check_response(response).await;
        }

        request.retried = true;
        let token = self.token_for_retry(sent_token.as_deref()).await?;
        request.set_bearer(&token)?;

        debug!(method = %request.method, path = %request.path, "Retrying with refreshed token");
        let (response, _) = self.dispatch(&request).await?;
        Self::check_response(response).await
    }

    fn can_retry(request: &OutgoingRequest) -> bool {
        let route = request.route();
        !request.retried && route != REFRESH_PATH && route != LOGIN_PATH
    }

    /// Pick the token to retry with after `rejected` was refused.
    ///
    /// If the stored token already differs from the rejected one, another
    /// request refreshed it in the meantime and no new refresh is needed.
    /// If it was removed, the session ended while the request was in flight
    /// and the `401` is returned as-is.
    async fn token_for_retry(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        match (self.inner.store.access_token()?, rejected) {
            (Some(current), rejected) if rejected != Some(current.as_str()) => {
                debug!("Access token changed since request was sent, skipping refresh");
                Ok(current)
            }
            (None, Some(_)) => {
                debug!("Session was cleared since request was sent, skipping refresh");
                Err(ApiError::Unauthorized)
            }
            _ => self.refresh_access_token().await,
        }
    }

    /// Send one attempt, returning the response and the bearer token it carried.
    async fn dispatch(
        &self,
        request: &OutgoingRequest,
    ) -> Result<(reqwest::Response, Option<String>), ApiError> {
        let mut headers = request.headers.clone();
        let mut sent_token = request.explicit_bearer().map(str::to_string);

        if !headers.contains_key(header::AUTHORIZATION) && request.route() != REFRESH_PATH {
            if let Some(token) = self.inner.store.access_token()? {
                headers.insert(header::AUTHORIZATION, bearer_value(&token)?);
                sent_token = Some(token);
            }
        }

        debug!(
            method = %request.method,
            path = %request.path,
            authenticated = sent_token.is_some(),
            retried = request.retried,
            "Sending request"
        );

        let mut builder = self
            .inner
            .client
            .request(request.method.clone(), self.url(&request.path))
            .headers(headers);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        Ok((response, sent_token))
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let text = response.text().await?;
        // 204 and friends decode as JSON null
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    // ===== JSON helpers =====

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: OutgoingRequest,
    ) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Self::read_json(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(OutgoingRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(OutgoingRequest::post(path).json(body)?).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(OutgoingRequest::put(path).json(body)?).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(OutgoingRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(OutgoingRequest::delete(path)).await?;
        Ok(())
    }
}
