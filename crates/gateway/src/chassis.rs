use std::collections::BTreeSet;
use std::sync::Arc;

use rpb_contracts::{Chassis, ChassisTaskType, ErrorKind, Host, MessageType};
use rpb_store::{ChassisStore, Reconciliation, StoreError};

use crate::messaging::SubscriberRegistry;
use crate::tasks::TaskTracker;
use crate::work_queue::{QueueClosed, WorkQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Rejected before scheduling.
    Store(StoreError),
    Queue(QueueClosed),
}

impl MutationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MutationError::Store(err) => err.kind(),
            MutationError::Queue(_) => ErrorKind::TaskInfrastructureFailure,
        }
    }
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::Store(err) => write!(f, "{}", err),
            MutationError::Queue(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for MutationError {}

impl From<StoreError> for MutationError {
    fn from(value: StoreError) -> Self {
        MutationError::Store(value)
    }
}

impl From<QueueClosed> for MutationError {
    fn from(value: QueueClosed) -> Self {
        MutationError::Queue(value)
    }
}

/// Chassis operations as exposed to the UI.
///
/// Create, update and delete are fire-and-forget: after cheap synchronous
/// validation the store change runs on the work queue wrapped in a tracked
/// task, and its outcome is only visible through the task and the logs.
/// Relation changes are applied synchronously.
#[derive(Clone)]
pub struct ChassisService {
    store: ChassisStore,
    tasks: TaskTracker,
    queue: Arc<WorkQueue>,
    subscribers: SubscriberRegistry,
}

impl ChassisService {
    pub fn new(
        store: ChassisStore,
        tasks: TaskTracker,
        queue: Arc<WorkQueue>,
        subscribers: SubscriberRegistry,
    ) -> Self {
        Self {
            store,
            tasks,
            queue,
            subscribers,
        }
    }

    pub fn list(&self) -> Vec<Chassis> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<Chassis, StoreError> {
        self.store
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn related_chassis(&self, host_id: &str) -> Vec<Chassis> {
        self.store.related_chassis(host_id)
    }

    pub fn list_hosts(&self) -> Vec<Host> {
        self.store.list_hosts()
    }

    pub fn related_hosts(&self, chassis_id: &str) -> Result<Vec<Host>, StoreError> {
        self.store.related_hosts(chassis_id)
    }

    pub fn create(&self, credential: &str, chassis: Chassis) -> Result<(), MutationError> {
        require_name(&chassis)?;
        let description = chassis.name.clone();
        self.schedule(credential, ChassisTaskType::Create, description, move |store| {
            store.create(chassis)
        })
    }

    pub fn update(&self, credential: &str, chassis: Chassis) -> Result<(), MutationError> {
        require_name(&chassis)?;
        self.get(&chassis.id)?;
        let description = chassis.name.clone();
        self.schedule(credential, ChassisTaskType::Update, description, move |store| {
            store.update(chassis)
        })
    }

    pub fn delete(&self, credential: &str, id: &str) -> Result<(), MutationError> {
        let existing = self.get(id)?;
        let id = id.to_string();
        self.schedule(credential, ChassisTaskType::Delete, existing.name, move |store| {
            store.delete(&id)
        })
    }

    pub fn reconcile_host(&self, host_id: &str, desired: &BTreeSet<String>) -> Reconciliation {
        let outcome = self.store.reconcile(host_id, desired);
        if !outcome.unknown.is_empty() {
            tracing::warn!(
                host_id,
                unknown = ?outcome.unknown,
                "ignoring unknown chassis ids in host relation"
            );
        }
        if outcome.changed() {
            tracing::info!(
                host_id,
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                "host relation reconciled"
            );
            self.subscribers
                .broadcast(MessageType::ChassisRelationChanged);
        }
        outcome
    }

    pub fn set_related_hosts(&self, chassis_id: &str, host_ids: &BTreeSet<String>) -> Result<bool, StoreError> {
        let changed = self.store.set_related_hosts(chassis_id, host_ids)?;
        if changed {
            tracing::info!(chassis_id, hosts = host_ids.len(), "chassis relation replaced");
            self.subscribers
                .broadcast(MessageType::ChassisRelationChanged);
        }
        Ok(changed)
    }

    fn schedule<F>(
        &self,
        credential: &str,
        task_type: ChassisTaskType,
        description: String,
        mutation: F,
    ) -> Result<(), MutationError>
    where
        F: FnOnce(&ChassisStore) -> Result<Chassis, StoreError> + Send + 'static,
    {
        let service = self.clone();
        let credential = credential.to_string();
        self.queue
            .submit(async move {
                service
                    .run_guarded(&credential, task_type, &description, mutation)
                    .await;
            })
            .map_err(MutationError::from)
    }

    async fn run_guarded<F>(&self, credential: &str, task_type: ChassisTaskType, description: &str, mutation: F)
    where
        F: FnOnce(&ChassisStore) -> Result<Chassis, StoreError>,
    {
        let task = self.tasks.begin(credential, task_type, description).await;

        match mutation(&self.store) {
            Ok(chassis) => {
                tracing::info!(
                    chassis_id = %chassis.id,
                    task_type = task_type.as_str(),
                    "chassis mutation applied"
                );
                self.subscribers.broadcast(MessageType::ChassisUpdated);
                let _ = task.succeed().await;
            }
            Err(err) => {
                tracing::warn!(
                    task_type = task_type.as_str(),
                    description,
                    kind = err.kind().as_str(),
                    error = %err,
                    "chassis mutation rejected"
                );
                let _ = task.fail(err.fault()).await;
            }
        }
    }
}

fn require_name(chassis: &Chassis) -> Result<(), StoreError> {
    if chassis.name.trim().is_empty() {
        return Err(StoreError::InvalidRecord("name must be non-empty"));
    }
    Ok(())
}
