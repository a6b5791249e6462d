//! Sync lifecycle: runs the revision stream and coalescer for exactly as long
//! as a session is authenticated, and turns request failures into user
//! notices.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use kaji_core::SyncConfig;

use crate::coalescer::{CacheInvalidator, Coalescer};
use crate::error::ApiError;
use crate::stream::{Backoff, StreamHandle, StreamState, StreamStatus};
use crate::token::TokenStore;
use crate::transport::EventTransport;

/// Timing knobs for one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub debounce: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// `false` when the platform has no usable push transport; the session
    /// then relies on online/visibility refreshes alone.
    pub streaming: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce_window(),
            backoff_min: config.backoff_min(),
            backoff_max: config.backoff_max(),
            streaming: config.streaming,
        }
    }
}

/// What the user should be told after a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// Another member changed the team state first; it has been reloaded.
    ConflictRefreshed,
    /// The session was rejected; local sync has been torn down.
    ///
    /// The cache seam can only mark regions stale, so the caller must drop
    /// every protected region itself (everything in [`CacheRegion::ALL`])
    /// before routing to sign-in. Otherwise the previous identity's data stays
    /// readable.
    ///
    /// [`CacheRegion::ALL`]: kaji_core::CacheRegion::ALL
    SessionExpired,
    RequestFailed { message: String },
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncNotice::ConflictRefreshed => f.write_str(
                "Someone else updated this just now. The latest state has been loaded, please try again.",
            ),
            SyncNotice::SessionExpired => {
                f.write_str("Your session has expired. Please sign in again.")
            }
            SyncNotice::RequestFailed { message } => write!(f, "Request failed: {message}"),
        }
    }
}

struct ActiveSession {
    coalescer: Coalescer,
    stream: Option<StreamHandle>,
}

pub struct SyncController {
    settings: SyncSettings,
    events: Arc<dyn EventTransport>,
    cache: Arc<dyn CacheInvalidator>,
    tokens: TokenStore,
    session: Option<ActiveSession>,
    hidden: bool,
}

impl SyncController {
    pub fn new(
        settings: SyncSettings,
        events: Arc<dyn EventTransport>,
        cache: Arc<dyn CacheInvalidator>,
        tokens: TokenStore,
    ) -> Self {
        Self {
            settings,
            events,
            cache,
            tokens,
            session: None,
            hidden: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Session hook: start on login, tear down on logout.
    pub async fn set_authenticated(&mut self, authenticated: bool) {
        if authenticated {
            self.start();
        } else {
            self.stop().await;
        }
    }

    /// Start the coalescer and, if enabled, the revision stream. No-op while
    /// already running. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if self.session.is_some() {
            return;
        }
        let coalescer = Coalescer::spawn(self.cache.clone(), self.settings.debounce);
        let stream = self.settings.streaming.then(|| {
            StreamHandle::spawn(
                self.events.clone(),
                coalescer.handle(),
                Backoff::new(self.settings.backoff_min, self.settings.backoff_max),
            )
        });
        tracing::info!(streaming = stream.is_some(), "team sync started");
        self.session = Some(ActiveSession { coalescer, stream });
    }

    /// Full teardown: close the stream, cancel reconnect and debounce timers,
    /// drop pending invalidations, forget the last-seen revision and the held
    /// token. Safe to call at any time, any number of times.
    pub async fn stop(&mut self) {
        self.tokens.clear();
        self.hidden = false;
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(stream) = session.stream.as_mut() {
            stream.stop().await;
        }
        session.coalescer.shutdown().await;
        tracing::info!("team sync stopped");
    }

    /// Network came back: refresh everything once.
    pub fn on_online(&self) {
        self.refresh_all("online");
    }

    /// Page visibility changed. Only a hidden → visible transition refreshes.
    pub fn on_visibility_change(&mut self, visible: bool) {
        if !visible {
            self.hidden = true;
            return;
        }
        if std::mem::take(&mut self.hidden) {
            self.refresh_all("visible");
        }
    }

    /// Recover from a failed request and decide what to show the user.
    ///
    /// Returns `None` when nothing new should be shown, i.e. a repeated
    /// `Unauthorized` after the session is already gone.
    pub async fn handle_request_error(&mut self, err: &ApiError) -> Option<SyncNotice> {
        match err {
            ApiError::PreconditionRequired | ApiError::PreconditionFailed { .. } => {
                match &self.session {
                    Some(session) => session.coalescer.handle().resync_all(),
                    None => self.cache.invalidate_all().await,
                }
                Some(SyncNotice::ConflictRefreshed)
            }
            ApiError::Unauthorized { .. } => {
                if self.session.is_none() {
                    return None;
                }
                tracing::warn!("session rejected; tearing down team sync");
                self.stop().await;
                Some(SyncNotice::SessionExpired)
            }
            ApiError::Transport(_) | ApiError::Request { .. } | ApiError::UnexpectedBody { .. } => {
                tracing::debug!(error = %err, "request failed");
                Some(SyncNotice::RequestFailed {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Status updates of the running stream; `None` when signed out or when
    /// streaming is disabled. The receiver closes on teardown.
    pub fn subscribe_status(&self) -> Option<watch::Receiver<StreamStatus>> {
        self.session
            .as_ref()
            .and_then(|session| session.stream.as_ref())
            .map(StreamHandle::subscribe)
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.session
            .as_ref()
            .and_then(|session| session.stream.as_ref())
            .map(StreamHandle::status)
            .unwrap_or(StreamStatus {
                state: StreamState::Disconnected,
                last_seen: 0,
            })
    }

    fn refresh_all(&self, reason: &'static str) {
        match &self.session {
            Some(session) => {
                tracing::debug!(reason, "catch-up refresh");
                session.coalescer.handle().resync_all();
            }
            None => tracing::debug!(reason, "not authenticated; catch-up refresh skipped"),
        }
    }
}
