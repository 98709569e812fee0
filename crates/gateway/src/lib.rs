use std::num::NonZeroUsize;
use std::sync::Arc;

use rpb_remote::{
    ApiGatewayClient, ApiGatewayConfig, CloneSessionConnector, SessionConnector,
    VimJsonClientFactory, VimJsonConfig,
};
use rpb_store::ChassisStore;

pub mod cache;
pub mod chassis;
pub mod config;
pub mod http;
pub mod messaging;
pub mod metrics;
pub mod privileges;
pub mod session;
pub mod tasks;
pub mod tickets;
pub mod work_queue;

#[cfg(test)]
mod testing;

use crate::chassis::ChassisService;
use crate::config::{GatewayConfig, StartupError};
use crate::messaging::SubscriberRegistry;
use crate::session::SessionCache;
use crate::tasks::TaskTracker;
use crate::tickets::TicketCache;
use crate::work_queue::WorkQueue;

/// Every long-lived service of the plugin backend, wired together.
///
/// Constructed once at startup and shared with the router; [`shutdown`]
/// drains outstanding work before logging out cached sessions.
///
/// [`shutdown`]: Gateway::shutdown
#[derive(Clone)]
pub struct Gateway {
    pub sessions: Arc<SessionCache>,
    pub tasks: TaskTracker,
    pub tickets: TicketCache,
    pub queue: Arc<WorkQueue>,
    pub subscribers: SubscriberRegistry,
    pub chassis: ChassisService,
}

fn nonzero(value: usize, key: &'static str) -> Result<NonZeroUsize, StartupError> {
    NonZeroUsize::new(value).ok_or_else(|| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} must be >= 1", key),
    })
}

impl Gateway {
    /// Builds the gateway against the remote backend named in `config`.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        let gateway = ApiGatewayClient::new(ApiGatewayConfig {
            base_url: config.backend.gateway_url.clone(),
            timeout: config.remote_timeout(),
        })
        .map_err(|err| StartupError {
            code: "ERR_REMOTE_CLIENT_INIT",
            message: err.to_string(),
        })?;

        let clients = VimJsonClientFactory::new(VimJsonConfig {
            api_url: config.backend.api_url.clone(),
            timeout: config.remote_timeout(),
        })
        .map_err(|err| StartupError {
            code: "ERR_REMOTE_CLIENT_INIT",
            message: err.to_string(),
        })?;

        let connector = CloneSessionConnector::new(
            gateway,
            Arc::new(clients),
            config.session_connect_timeout(),
        );

        Self::with_connector(Arc::new(connector), config)
    }

    pub fn with_connector(
        connector: Arc<dyn SessionConnector>,
        config: &GatewayConfig,
    ) -> Result<Self, StartupError> {
        let sessions = Arc::new(SessionCache::new(
            connector,
            config.backend.backend_id.clone(),
            nonzero(config.session_cache_max_entries, "RPB_SESSION_CACHE_MAX_ENTRIES")?,
            config.session_idle_ttl(),
        ));
        if let Some(interval) = config.session_sweep_interval() {
            sessions.spawn_sweeper(interval);
        }

        let tickets = TicketCache::new(
            nonzero(config.ticket_max_entries, "RPB_TICKET_MAX_ENTRIES")?,
            config.ticket_ttl(),
        );
        let tasks = TaskTracker::new(sessions.clone());
        let queue = Arc::new(WorkQueue::new(config.task_workers));
        let subscribers = SubscriberRegistry::new();
        let chassis = ChassisService::new(
            ChassisStore::with_seed_data(config.seed_chassis_count),
            tasks.clone(),
            queue.clone(),
            subscribers.clone(),
        );

        Ok(Self {
            sessions,
            tasks,
            tickets,
            queue,
            subscribers,
            chassis,
        })
    }

    /// Lets queued mutations finish, then logs out every cached session.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.sessions.shutdown().await;
        tracing::info!("gateway shut down");
    }
}
