use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{OnceCell, RwLock};

use crate::{
    API_SESSION_ID_HEADER, DelegatedLogin, ManagedObjectRef, RemoteClient, RemoteClientFactory,
    RemoteError, RemoteTaskRef, RemoteTaskState, UserSession,
};

const SESSION_MANAGER: &str = "SessionManager";
const SERVICE_INSTANCE: &str = "ServiceInstance";

#[derive(Debug, Clone)]
pub struct VimJsonConfig {
    /// Base of the JSON API, e.g. `https://vc.example:443/sdk/vim25/8.0.1.0`.
    pub api_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
struct MorefWire {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
}

impl From<MorefWire> for ManagedObjectRef {
    fn from(value: MorefWire) -> Self {
        ManagedObjectRef {
            type_name: value.type_name,
            value: value.value,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    task_manager: MorefWire,
    root_folder: MorefWire,
    authorization_manager: MorefWire,
}

#[derive(Deserialize)]
struct TaskInfoWire {
    key: String,
    task: MorefWire,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityPrivilegeWire {
    #[serde(default)]
    priv_availability: Vec<PrivilegeAvailabilityWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivilegeAvailabilityWire {
    is_granted: bool,
}

fn moref_json(moref: &ManagedObjectRef) -> Value {
    json!({
        "_typeName": "ManagedObjectReference",
        "type": moref.type_name,
        "value": moref.value,
    })
}

/// Remote client speaking the management server's JSON API.
///
/// One instance holds at most one authenticated session; the session id
/// returned by the clone-session login is replayed on every later call.
pub struct VimJsonClient {
    api_url: String,
    http: reqwest::Client,
    session_id: RwLock<Option<String>>,
    content: OnceCell<ServiceContent>,
}

impl VimJsonClient {
    pub fn new(http: reqwest::Client, api_url: String) -> Self {
        Self {
            api_url,
            http,
            session_id: RwLock::new(None),
            content: OnceCell::new(),
        }
    }

    fn url(&self, type_name: &str, moid: &str, method: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_url.trim_end_matches('/'),
            type_name,
            moid,
            method
        )
    }

    async fn session_header(&self) -> Result<String, RemoteError> {
        self.session_id
            .read()
            .await
            .clone()
            .ok_or_else(|| RemoteError::Rejected("remote client is not logged in".to_string()))
    }

    async fn invoke(&self, url: String, body: Value, context: &str) -> Result<reqwest::Response, RemoteError> {
        let session_id = self.session_header().await?;
        let resp = self
            .http
            .post(url)
            .header(API_SESSION_ID_HEADER, session_id)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RemoteError::from_status(resp.status(), context));
        }

        Ok(resp)
    }

    async fn service_content(&self) -> Result<&ServiceContent, RemoteError> {
        self.content
            .get_or_try_init(|| async {
                let session_id = self.session_header().await?;
                let url = format!(
                    "{}/{}/{}/content",
                    self.api_url.trim_end_matches('/'),
                    SERVICE_INSTANCE,
                    SERVICE_INSTANCE
                );
                let resp = self
                    .http
                    .get(url)
                    .header(API_SESSION_ID_HEADER, session_id)
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(RemoteError::from_status(resp.status(), "service content"));
                }
                resp.json::<ServiceContent>()
                    .await
                    .map_err(|_| RemoteError::Unknown("invalid service content".to_string()))
            })
            .await
    }
}

#[async_trait]
impl RemoteClient for VimJsonClient {
    async fn login(&self, login: &DelegatedLogin) -> Result<UserSession, RemoteError> {
        let resp = self
            .http
            .post(self.url(SESSION_MANAGER, SESSION_MANAGER, "CloneSession"))
            .json(&json!({ "cloneTicket": login.clone_ticket }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RemoteError::from_status(resp.status(), "clone session"));
        }

        let session_id = resp
            .headers()
            .get(API_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| RemoteError::Unknown("clone session reply carried no session id".to_string()))?;

        let user = resp
            .json::<UserSession>()
            .await
            .map_err(|_| RemoteError::Unknown("invalid user session in clone session reply".to_string()))?;

        *self.session_id.write().await = Some(session_id);
        Ok(user)
    }

    async fn logout(&self) -> Result<(), RemoteError> {
        let url = self.url(SESSION_MANAGER, SESSION_MANAGER, "Logout");
        self.invoke(url, json!({}), "logout").await?;
        *self.session_id.write().await = None;
        Ok(())
    }

    async fn create_task(
        &self,
        task_type_id: &str,
        initiated_by: &str,
    ) -> Result<RemoteTaskRef, RemoteError> {
        let content = self.service_content().await?;
        let root_folder: ManagedObjectRef = content.root_folder.clone().into();
        let url = self.url("TaskManager", &content.task_manager.value, "CreateTask");

        let task = self
            .invoke(
                url,
                json!({
                    "obj": moref_json(&root_folder),
                    "taskTypeId": task_type_id,
                    "initiatedBy": initiated_by,
                    "cancelable": false,
                }),
                "create task",
            )
            .await?
            .json::<TaskInfoWire>()
            .await
            .map_err(|_| RemoteError::Unknown("invalid task info in create task reply".to_string()))?;

        Ok(RemoteTaskRef {
            key: task.key,
            task: task.task.into(),
        })
    }

    async fn set_task_state(
        &self,
        task: &RemoteTaskRef,
        state: RemoteTaskState,
        fault: Option<&str>,
    ) -> Result<(), RemoteError> {
        let mut body = json!({ "state": state.as_wire() });
        if let Some(fault) = fault {
            body["fault"] = json!({
                "_typeName": "LocalizedMethodFault",
                "fault": { "_typeName": fault },
                "localizedMessage": fault,
            });
        }

        let url = self.url(&task.task.type_name, &task.task.value, "SetTaskState");
        self.invoke(url, body, "set task state").await?;
        Ok(())
    }

    async fn set_task_description(
        &self,
        task: &RemoteTaskRef,
        message_key: &str,
        message: &str,
    ) -> Result<(), RemoteError> {
        let url = self.url(&task.task.type_name, &task.task.value, "SetTaskDescription");
        self.invoke(
            url,
            json!({
                "description": {
                    "_typeName": "LocalizableMessage",
                    "key": message_key,
                    "message": message,
                }
            }),
            "set task description",
        )
        .await?;
        Ok(())
    }

    async fn has_privilege(
        &self,
        session_key: &str,
        entities: &[ManagedObjectRef],
        privilege_id: &str,
    ) -> Result<bool, RemoteError> {
        let content = self.service_content().await?;
        let url = self.url(
            "AuthorizationManager",
            &content.authorization_manager.value,
            "HasPrivilegeOnEntities",
        );

        let privileges = self
            .invoke(
                url,
                json!({
                    "entity": entities.iter().map(moref_json).collect::<Vec<_>>(),
                    "sessionId": session_key,
                    "privId": [privilege_id],
                }),
                "has privilege",
            )
            .await?
            .json::<Vec<EntityPrivilegeWire>>()
            .await
            .map_err(|_| RemoteError::Unknown("invalid privilege reply".to_string()))?;

        // An entity the reply says nothing about is not granted.
        Ok(!privileges.is_empty()
            && privileges.iter().all(|entity| {
                !entity.priv_availability.is_empty()
                    && entity
                        .priv_availability
                        .iter()
                        .all(|availability| availability.is_granted)
            }))
    }
}

/// Hands out [`VimJsonClient`]s sharing one connection pool.
#[derive(Clone)]
pub struct VimJsonClientFactory {
    api_url: String,
    http: reqwest::Client,
}

impl VimJsonClientFactory {
    pub fn new(config: VimJsonConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RemoteError::Unknown(format!("failed to build remote client: {}", err)))?;

        Ok(Self {
            api_url: config.api_url,
            http,
        })
    }
}

impl RemoteClientFactory for VimJsonClientFactory {
    fn new_client(&self) -> Arc<dyn RemoteClient> {
        Arc::new(VimJsonClient::new(self.http.clone(), self.api_url.clone()))
    }
}
