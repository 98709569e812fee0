use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rpb_contracts::{ChassisTaskType, FaultKind, TaskState};
use rpb_remote::{RemoteSession, RemoteTaskRef, RemoteTaskState};
use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::session::SessionCache;

const TASK_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub task_type: ChassisTaskType,
    pub description: String,
    pub state: TaskState,
    /// `None` in degraded mode: the remote task could not be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_task_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
}

fn log_task_infrastructure_failure(
    task_id: &str,
    task_type: ChassisTaskType,
    step: &'static str,
    err: &dyn std::fmt::Display,
) {
    tracing::error!(
        kind = FaultKind::TaskInfrastructureFailure.as_str(),
        task_id,
        task_type = task_type.as_str(),
        step,
        error = %err,
        "remote task bookkeeping failed"
    );
}

/// Mirrors guarded mutations as remote tasks and keeps a bounded log of the
/// most recent ones.
///
/// Remote task visibility is best-effort: any failure talking to the remote
/// task manager is logged and the local operation carries on.
#[derive(Clone)]
pub struct TaskTracker {
    sessions: Arc<SessionCache>,
    log: Arc<Mutex<VecDeque<TaskRecord>>>,
    log_capacity: usize,
}

impl TaskTracker {
    pub fn new(sessions: Arc<SessionCache>) -> Self {
        Self::with_log_capacity(sessions, TASK_LOG_CAPACITY)
    }

    pub fn with_log_capacity(sessions: Arc<SessionCache>, log_capacity: usize) -> Self {
        Self {
            sessions,
            log: Arc::new(Mutex::new(VecDeque::new())),
            log_capacity: log_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TaskRecord>> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<TaskRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Starts a task in `RUNNING`. Never fails: if the remote task cannot be
    /// created the returned handle is degraded.
    pub async fn begin(
        &self,
        credential: &str,
        task_type: ChassisTaskType,
        description: &str,
    ) -> TaskHandle {
        let mut record = TaskRecord {
            id: ulid::Ulid::new().to_string(),
            task_type,
            description: description.to_string(),
            state: TaskState::Running,
            remote_task_key: None,
            fault: None,
        };

        let remote = match self.sessions.get(credential).await {
            Ok(session) => create_remote_task(&session, &record).await,
            Err(err) => {
                log_task_infrastructure_failure(&record.id, task_type, "resolve_session", &err);
                None
            }
        };
        record.remote_task_key = remote.as_ref().map(|task| task.key.clone());

        {
            let mut log = self.lock();
            while log.len() >= self.log_capacity {
                log.pop_front();
            }
            log.push_back(record.clone());
        }

        tracing::info!(
            task_id = %record.id,
            task_type = task_type.as_str(),
            description,
            degraded = remote.is_none(),
            "task started"
        );

        TaskHandle {
            tracker: self.clone(),
            credential: credential.to_string(),
            record,
            remote,
            finished: false,
        }
    }

    fn store_terminal(&self, record: &TaskRecord) {
        if let Some(slot) = self.lock().iter_mut().find(|r| r.id == record.id) {
            *slot = record.clone();
        }
        metrics::observe_task(record.task_type.as_str(), record.state.as_str());
    }
}

async fn create_remote_task(session: &RemoteSession, record: &TaskRecord) -> Option<RemoteTaskRef> {
    let client = &session.client;
    let task = match client
        .create_task(record.task_type.task_type_id(), &session.user.user_name)
        .await
    {
        Ok(task) => task,
        Err(err) => {
            log_task_infrastructure_failure(&record.id, record.task_type, "create_task", &err);
            return None;
        }
    };

    if let Err(err) = client
        .set_task_state(&task, RemoteTaskState::Running, None)
        .await
    {
        log_task_infrastructure_failure(&record.id, record.task_type, "set_task_state", &err);
    }

    let description_key = format!("{}.details", task.key);
    if let Err(err) = client
        .set_task_description(&task, &description_key, &record.description)
        .await
    {
        log_task_infrastructure_failure(&record.id, record.task_type, "set_task_description", &err);
    }

    Some(task)
}

/// A task in `RUNNING`. Consumed by exactly one of [`succeed`](Self::succeed)
/// or [`fail`](Self::fail); a handle dropped without either ends in `ERROR`
/// locally.
#[must_use = "a task must be completed with succeed() or fail()"]
pub struct TaskHandle {
    tracker: TaskTracker,
    credential: String,
    record: TaskRecord,
    remote: Option<RemoteTaskRef>,
    finished: bool,
}

impl TaskHandle {
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn is_degraded(&self) -> bool {
        self.remote.is_none()
    }

    pub async fn succeed(self) -> TaskRecord {
        self.finish(TaskState::Success, None).await
    }

    pub async fn fail(self, fault: FaultKind) -> TaskRecord {
        self.finish(TaskState::Error, Some(fault)).await
    }

    async fn finish(mut self, state: TaskState, fault: Option<FaultKind>) -> TaskRecord {
        self.finished = true;
        self.record.state = state;
        self.record.fault = fault;
        self.tracker.store_terminal(&self.record);

        match &self.remote {
            Some(task) => self.publish_terminal(task, state, fault).await,
            None => tracing::debug!(
                task_id = %self.record.id,
                state = state.as_str(),
                "degraded task finished without remote task"
            ),
        }

        tracing::info!(
            task_id = %self.record.id,
            task_type = self.record.task_type.as_str(),
            state = state.as_str(),
            fault = fault.map(FaultKind::as_str),
            "task finished"
        );

        self.record.clone()
    }

    async fn publish_terminal(&self, task: &RemoteTaskRef, state: TaskState, fault: Option<FaultKind>) {
        let remote_state = match state {
            TaskState::Running => RemoteTaskState::Running,
            TaskState::Success => RemoteTaskState::Success,
            TaskState::Error => RemoteTaskState::Error,
        };

        let session = match self.tracker.sessions.get(&self.credential).await {
            Ok(session) => session,
            Err(err) => {
                log_task_infrastructure_failure(&self.record.id, self.record.task_type, "resolve_session", &err);
                return;
            }
        };

        if let Err(err) = session
            .client
            .set_task_state(task, remote_state, fault.map(FaultKind::remote_fault_type))
            .await
        {
            log_task_infrastructure_failure(&self.record.id, self.record.task_type, "set_task_state", &err);
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.record.state = TaskState::Error;
        self.record.fault = Some(FaultKind::TaskInfrastructureFailure);
        self.tracker.store_terminal(&self.record);
        tracing::error!(
            kind = FaultKind::TaskInfrastructureFailure.as_str(),
            task_id = %self.record.id,
            task_type = self.record.task_type.as_str(),
            "task abandoned before completion"
        );
    }
}
