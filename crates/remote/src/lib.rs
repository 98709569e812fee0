use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use serde::Deserialize;

mod connector;
mod gateway;
mod vim;

pub use connector::CloneSessionConnector;
pub use gateway::{ApiGatewayClient, ApiGatewayConfig};
pub use vim::{VimJsonClient, VimJsonClientFactory, VimJsonConfig};

/// Header (and query parameter) carrying the caller's opaque session id.
pub const API_SESSION_ID_HEADER: &str = "vmware-api-session-id";

/// Composite key of the session cache: one remote session per caller
/// session and backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    caller_session_id: String,
    backend_id: String,
}

impl SessionKey {
    pub fn new(caller_session_id: &str, backend_id: &str) -> Option<Self> {
        let caller_session_id = caller_session_id.trim();
        let backend_id = backend_id.trim();
        if caller_session_id.is_empty() || backend_id.is_empty() {
            return None;
        }

        Some(Self {
            caller_session_id: caller_session_id.to_string(),
            backend_id: backend_id.to_string(),
        })
    }

    pub fn caller_session_id(&self) -> &str {
        &self.caller_session_id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

/// Short-lived artifact returned by the auxiliary gateway and accepted by
/// the backend login call in place of the caller's credential.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedLogin {
    pub clone_ticket: String,
}

impl std::fmt::Debug for DelegatedLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedLogin")
            .field("clone_ticket", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub key: String,
    pub user_name: String,
}

/// Reference to a managed object on the remote side (`type` + `value`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedObjectRef {
    pub type_name: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(type_name: &str, value: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            value: value.to_string(),
        }
    }

    /// Parses a UI object id of the form
    /// `urn:vmomi:<Type>:<id>:<serverGuid>`.
    pub fn from_object_id(object_id: &str) -> Option<Self> {
        let mut parts = object_id.split(':');
        let (Some("urn"), Some("vmomi"), Some(type_name), Some(value)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };

        if type_name.is_empty() || value.is_empty() {
            return None;
        }

        Some(Self::new(type_name, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTaskRef {
    pub key: String,
    pub task: ManagedObjectRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTaskState {
    Running,
    Success,
    Error,
}

impl RemoteTaskState {
    pub fn as_wire(self) -> &'static str {
        match self {
            RemoteTaskState::Running => "running",
            RemoteTaskState::Success => "success",
            RemoteTaskState::Error => "error",
        }
    }
}

/// The three classes every backend-specific fault collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFault {
    Unreachable,
    Rejected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    Timeout,
    Unreachable(String),
    Rejected(String),
    Unknown(String),
}

impl RemoteError {
    pub fn fault(&self) -> RemoteFault {
        match self {
            RemoteError::Timeout | RemoteError::Unreachable(_) => RemoteFault::Unreachable,
            RemoteError::Rejected(_) => RemoteFault::Rejected,
            RemoteError::Unknown(_) => RemoteFault::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::Timeout => "ERR_BACKEND_TIMEOUT",
            RemoteError::Unreachable(_) => "ERR_BACKEND_UNREACHABLE",
            RemoteError::Rejected(_) => "ERR_AUTH_REJECTED",
            RemoteError::Unknown(_) => "ERR_BACKEND_UNKNOWN",
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let message = format!("{} returned status {}", context, status);
        match status.as_u16() {
            401 | 403 => RemoteError::Rejected(message),
            500..=599 => RemoteError::Unreachable(message),
            _ => RemoteError::Unknown(message),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Timeout => write!(f, "remote call timed out"),
            RemoteError::Unreachable(msg) => write!(f, "remote backend unreachable: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "remote backend rejected the request: {}", msg),
            RemoteError::Unknown(msg) => write!(f, "remote backend fault: {}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            RemoteError::Timeout
        } else if value.is_connect() || value.is_request() {
            RemoteError::Unreachable(value.to_string())
        } else if let Some(status) = value.status() {
            RemoteError::from_status(status, "remote endpoint")
        } else {
            RemoteError::Unknown(value.to_string())
        }
    }
}

/// Handle to one logged-in connection against the remote management server.
///
/// All calls act on behalf of the session established by [`login`](Self::login).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn login(&self, login: &DelegatedLogin) -> Result<UserSession, RemoteError>;

    async fn logout(&self) -> Result<(), RemoteError>;

    async fn create_task(
        &self,
        task_type_id: &str,
        initiated_by: &str,
    ) -> Result<RemoteTaskRef, RemoteError>;

    /// `fault` is the remote fault type name reported with an `Error` state.
    async fn set_task_state(
        &self,
        task: &RemoteTaskRef,
        state: RemoteTaskState,
        fault: Option<&str>,
    ) -> Result<(), RemoteError>;

    async fn set_task_description(
        &self,
        task: &RemoteTaskRef,
        message_key: &str,
        message: &str,
    ) -> Result<(), RemoteError>;

    async fn has_privilege(
        &self,
        session_key: &str,
        entities: &[ManagedObjectRef],
        privilege_id: &str,
    ) -> Result<bool, RemoteError>;
}

/// Produces fresh, not-yet-logged-in client handles.
pub trait RemoteClientFactory: Send + Sync {
    fn new_client(&self) -> Arc<dyn RemoteClient>;
}

/// A live remote connection plus the authenticated context it was opened with.
#[derive(Clone)]
pub struct RemoteSession {
    pub client: Arc<dyn RemoteClient>,
    pub user: UserSession,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("user_name", &self.user.user_name)
            .finish_non_exhaustive()
    }
}

/// Establishes a remote session for a cache key. Implementations must not
/// cache anything themselves; caching is the caller's concern.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, key: &SessionKey) -> Result<RemoteSession, RemoteError>;
}

/// Reads the caller credential from the request headers.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}
