//! Session state: is a user logged in, and with which tokens.
//!
//! A [`Session`] starts in [`SessionState::Initializing`] and leaves it exactly
//! once, when [`Session::init`] has read the token pair from durable storage.
//! Afterwards it follows `login`/`logout` and the refresh outcomes reported by
//! the [`ApiClient`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};

use super::{Credentials, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Durable storage has not been read yet
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Notifications broadcast by [`ApiClient`] after a token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    /// A new access token was stored
    TokenRefreshed,
    /// Refresh failed and the stored tokens were removed; the user must log in again
    Invalidated,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl SessionSnapshot {
    fn initializing() -> Self {
        Self {
            state: SessionState::Initializing,
            access_token: None,
            refresh_token: None,
        }
    }

    fn authenticated(access_token: String, refresh_token: String) -> Self {
        Self {
            state: SessionState::Authenticated,
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
        }
    }

    fn unauthenticated() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            access_token: None,
            refresh_token: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated && self.access_token.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.state == SessionState::Initializing
    }
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("state", &self.state)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Session {
    client: ApiClient,
    state: Arc<watch::Sender<SessionSnapshot>>,
    // Subscribed at construction so no event is missed before init
    events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(client: ApiClient) -> Self {
        let events = client.subscribe();
        let (state, _) = watch::channel(SessionSnapshot::initializing());
        Self {
            client,
            state: Arc::new(state),
            events: Mutex::new(Some(events)),
            listener: Mutex::new(None),
        }
    }

    /// Restore the session from durable storage.
    ///
    /// Only the first call does anything. A token pair with either half
    /// missing is cleared from storage and the session starts logged out.
    /// Must be called from within a tokio runtime to track token refreshes.
    pub fn init(&self) {
        let transitioned = self.state.send_if_modified(|current| {
            if !current.is_loading() {
                return false;
            }
            *current = restore(self.client.store().as_ref());
            true
        });

        if transitioned {
            self.spawn_listener();
        } else {
            debug!("Session already initialized");
        }
    }

    /// Log in with the given credentials and persist the returned tokens.
    ///
    /// On failure the state is left untouched and the error is returned.
    pub async fn login(&self, credentials: Credentials) -> Result<(), ApiError> {
        self.init();
        info!(email = %credentials.email, "Logging in");

        let tokens = self.client.login(&credentials).await?;

        let store = self.client.store();
        if let Err(e) = store.save_tokens(&tokens) {
            // Never leave half a pair behind
            if let Err(clear_err) = store.clear_tokens() {
                warn!(error = %clear_err, "Failed to clear partially saved tokens");
            }
            return Err(e.into());
        }

        self.state.send_replace(SessionSnapshot::authenticated(
            tokens.access_token,
            tokens.refresh_token,
        ));
        info!("Logged in");
        Ok(())
    }

    /// Forget the session locally. No server call is made.
    pub fn logout(&self) {
        self.init();
        if let Err(e) = self.client.store().clear_tokens() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.state.send_replace(SessionSnapshot::unauthenticated());
        info!("Logged out");
    }

    /// Stop following refresh events. State stays as it was.
    pub fn dispose(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        lock(&self.events).take();
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    /// Watch state changes, e.g. to gate views on `is_authenticated`
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    fn spawn_listener(&self) {
        let Some(mut events) = lock(&self.events).take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, session will not follow token refreshes");
            return;
        };

        let state = Arc::clone(&self.state);
        let store = Arc::clone(self.client.store());

        let listener = runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => apply_event(&state, store.as_ref(), event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed session events, resyncing from storage");
                        resync(&state, store.as_ref());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.listener) = Some(listener);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Read the stored pair, clearing it unless both halves are present.
fn restore(store: &dyn TokenStore) -> SessionSnapshot {
    let stored = store
        .access_token()
        .and_then(|access| Ok((access, store.refresh_token()?)));

    match stored {
        Ok((Some(access), Some(refresh))) => {
            info!("Restored session from storage");
            return SessionSnapshot::authenticated(access, refresh);
        }
        Ok((None, None)) => {
            debug!("No stored session");
            return SessionSnapshot::unauthenticated();
        }
        Ok(_) => warn!("Discarding incomplete token pair"),
        Err(e) => warn!(error = %e, "Failed to read stored tokens, starting logged out"),
    }

    if let Err(e) = store.clear_tokens() {
        warn!(error = %e, "Failed to clear stored tokens");
    }
    SessionSnapshot::unauthenticated()
}

fn apply_event(
    state: &watch::Sender<SessionSnapshot>,
    store: &dyn TokenStore,
    event: SessionEvent,
) {
    match event {
        // A login may have completed after the failed refresh
        SessionEvent::Invalidated if matches!(store.access_token(), Ok(Some(_))) => {
            debug!("Storage holds a newer session, ignoring invalidation");
            resync(state, store);
        }
        SessionEvent::Invalidated => {
            state.send_if_modified(|current| {
                if current.state != SessionState::Authenticated {
                    return false;
                }
                info!("Session invalidated by failed token refresh");
                *current = SessionSnapshot::unauthenticated();
                true
            });
        }
        SessionEvent::TokenRefreshed => resync(state, store),
    }
}

/// Bring an authenticated snapshot in line with what storage holds now.
fn resync(state: &watch::Sender<SessionSnapshot>, store: &dyn TokenStore) {
    let access = match store.access_token() {
        Ok(access) => access,
        Err(e) => {
            warn!(error = %e, "Failed to read access token");
            return;
        }
    };
    let refresh = store.refresh_token().ok().flatten();

    state.send_if_modified(|current| {
        if current.state != SessionState::Authenticated {
            return false;
        }
        match access {
            Some(access) => {
                let changed = current.access_token.as_deref() != Some(access.as_str())
                    || (refresh.is_some() && current.refresh_token != refresh);
                current.access_token = Some(access);
                if refresh.is_some() {
                    current.refresh_token = refresh;
                }
                changed
            }
            None => {
                *current = SessionSnapshot::unauthenticated();
                true
            }
        }
    });
}
