use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rpb_contracts::ErrorKind;
use rpb_remote::{RemoteError, RemoteFault, RemoteSession, SessionConnector, SessionKey};
use tokio::task::JoinHandle;

use crate::cache::{LoadingCache, RemovalCause, RemovalListener};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    MissingCredential,
    Remote(RemoteError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::MissingCredential => ErrorKind::AuthRejected,
            SessionError::Remote(err) => match err.fault() {
                RemoteFault::Unreachable => ErrorKind::BackendUnreachable,
                RemoteFault::Rejected => ErrorKind::AuthRejected,
                RemoteFault::Unknown => ErrorKind::Unknown,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::MissingCredential => "ERR_MISSING_CREDENTIAL",
            SessionError::Remote(err) => err.code(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MissingCredential => write!(f, "no session credential was presented"),
            SessionError::Remote(err) => write!(f, "failed to establish remote session: {}", err),
        }
    }
}

impl std::error::Error for SessionError {}

/// Logs the remote session out whenever the cache lets go of it.
struct LogoutOnRemoval;

#[async_trait]
impl RemovalListener<SessionKey, RemoteSession> for LogoutOnRemoval {
    async fn on_removal(&self, key: SessionKey, session: Arc<RemoteSession>, cause: RemovalCause) {
        metrics::observe_session_eviction(cause.as_str());

        match session.client.logout().await {
            Ok(()) => tracing::debug!(
                session_backend = %key.backend_id(),
                user_name = %session.user.user_name,
                cause = cause.as_str(),
                "remote session logged out"
            ),
            Err(err) => tracing::info!(
                session_backend = %key.backend_id(),
                cause = cause.as_str(),
                error = %err,
                "session already destroyed"
            ),
        }
    }
}

/// Remote sessions keyed by (caller session id, backend id).
///
/// Built on [`LoadingCache`], so lookups are single-flight per key, idle
/// sessions expire, and every removal logs the remote session out.
pub struct SessionCache {
    cache: LoadingCache<SessionKey, RemoteSession, RemoteError>,
    connector: Arc<dyn SessionConnector>,
    backend_id: String,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCache {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        backend_id: String,
        capacity: NonZeroUsize,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            cache: LoadingCache::new(capacity, idle_ttl, Arc::new(LogoutOnRemoval)),
            connector,
            backend_id,
            sweeper: Mutex::new(None),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn key(&self, credential: &str) -> Result<SessionKey, SessionError> {
        SessionKey::new(credential, &self.backend_id).ok_or(SessionError::MissingCredential)
    }

    /// Resolves the remote session for a caller credential, establishing it
    /// on first use.
    pub async fn get(&self, credential: &str) -> Result<Arc<RemoteSession>, SessionError> {
        let key = self.key(credential)?;
        let loaded = AtomicBool::new(false);

        let result = self
            .cache
            .get_with(key.clone(), || async {
                loaded.store(true, Ordering::Relaxed);
                self.connector.connect(&key).await
            })
            .await;

        match &result {
            Ok(_) if loaded.load(Ordering::Relaxed) => metrics::observe_session_cache_event("miss"),
            Ok(_) => metrics::observe_session_cache_event("hit"),
            Err(err) => {
                metrics::observe_session_cache_event("load_error");
                tracing::warn!(
                    session_backend = %key.backend_id(),
                    error = %err,
                    "remote session could not be established"
                );
            }
        }

        result.map_err(SessionError::Remote)
    }

    pub async fn invalidate(&self, credential: &str) -> bool {
        match self.key(credential) {
            Ok(key) => self.cache.invalidate(&key).await,
            Err(_) => false,
        }
    }

    /// Starts a background task that removes idle sessions every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "swept idle remote sessions");
                }
            }
        });

        let previous = match self.sweeper.lock() {
            Ok(mut guard) => guard.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the sweeper and logs out every resident session.
    pub async fn shutdown(&self) -> usize {
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let removed = self.cache.invalidate_all().await;
        tracing::info!(removed, "session cache drained");
        removed
    }
}
