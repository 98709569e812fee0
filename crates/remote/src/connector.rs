use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ApiGatewayClient, RemoteClientFactory, RemoteError, RemoteSession, SessionConnector,
    SessionKey,
};

/// Opens a remote session in two steps: a clone ticket is acquired from the
/// auxiliary gateway, then a fresh client logs in with it.
///
/// The whole sequence is bounded by `connect_timeout`; a timeout surfaces as
/// [`RemoteError::Timeout`].
pub struct CloneSessionConnector {
    gateway: ApiGatewayClient,
    clients: Arc<dyn RemoteClientFactory>,
    connect_timeout: Duration,
}

impl CloneSessionConnector {
    pub fn new(
        gateway: ApiGatewayClient,
        clients: Arc<dyn RemoteClientFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            clients,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SessionConnector for CloneSessionConnector {
    async fn connect(&self, key: &SessionKey) -> Result<RemoteSession, RemoteError> {
        let open = async {
            let login = self.gateway.acquire_clone_ticket(key).await?;
            let client = self.clients.new_client();
            let user = client.login(&login).await?;
            Ok::<_, RemoteError>(RemoteSession { client, user })
        };

        let session = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| RemoteError::Timeout)??;

        tracing::debug!(
            backend_id = %key.backend_id(),
            user_name = %session.user.user_name,
            "remote session established"
        );
        Ok(session)
    }
}
