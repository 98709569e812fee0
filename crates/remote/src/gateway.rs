use std::time::Duration;

use serde::Deserialize;

use crate::{API_SESSION_ID_HEADER, DelegatedLogin, RemoteError, SessionKey};

const CLONE_TICKET_PATH: &str = "/vcenter/session/clone-ticket";

#[derive(Debug, Clone)]
pub struct ApiGatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct CloneTicketReply {
    session_clone_ticket: String,
}

/// Client for the auxiliary API gateway that exchanges a caller's session id
/// for a clone ticket usable against the backend's session manager.
#[derive(Clone)]
pub struct ApiGatewayClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiGatewayClient {
    pub fn new(config: ApiGatewayConfig) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RemoteError::Unknown(format!("failed to build gateway client: {}", err)))?;

        Ok(Self {
            base_url: config.base_url,
            http,
        })
    }

    pub async fn acquire_clone_ticket(&self, key: &SessionKey) -> Result<DelegatedLogin, RemoteError> {
        let resp = self
            .http
            .post(self.clone_ticket_url())
            .header(API_SESSION_ID_HEADER, key.caller_session_id())
            .json(&serde_json::json!({ "vc_guid": key.backend_id() }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RemoteError::from_status(resp.status(), "clone ticket gateway"));
        }

        let reply = resp
            .json::<CloneTicketReply>()
            .await
            .map_err(|_| RemoteError::Unknown("gateway returned an invalid clone ticket reply".to_string()))?;

        if reply.session_clone_ticket.trim().is_empty() {
            return Err(RemoteError::Unknown("gateway returned an empty clone ticket".to_string()));
        }

        Ok(DelegatedLogin {
            clone_ticket: reply.session_clone_ticket,
        })
    }

    fn clone_ticket_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), CLONE_TICKET_PATH)
    }
}
