use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rpb_remote::{
    DelegatedLogin, ManagedObjectRef, RemoteClient, RemoteError, RemoteSession, RemoteTaskRef,
    RemoteTaskState, SessionConnector, SessionKey, UserSession,
};

/// In-process stand-in for a logged-in remote client. Records every task
/// call so tests can assert on the remote task lifecycle.
#[derive(Default)]
pub struct FakeRemote {
    logouts: AtomicUsize,
    logged_out: AtomicBool,
    tasks_created: AtomicUsize,
    pub fail_create_task: AtomicBool,
    pub fail_set_state: AtomicBool,
    pub deny_privileges: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn login(&self, _login: &DelegatedLogin) -> Result<UserSession, RemoteError> {
        Ok(UserSession {
            key: "52a8".to_string(),
            user_name: "VSPHERE.LOCAL\\Administrator".to_string(),
        })
    }

    async fn logout(&self) -> Result<(), RemoteError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.logged_out.swap(true, Ordering::SeqCst) {
            return Err(RemoteError::Rejected("session already logged out".to_string()));
        }
        Ok(())
    }

    async fn create_task(
        &self,
        task_type_id: &str,
        initiated_by: &str,
    ) -> Result<RemoteTaskRef, RemoteError> {
        if self.fail_create_task.load(Ordering::SeqCst) {
            return Err(RemoteError::Unknown("task type not registered".to_string()));
        }
        let n = self.tasks_created.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("create_task {} {}", task_type_id, initiated_by));
        Ok(RemoteTaskRef {
            key: format!("task-{}", n),
            task: ManagedObjectRef::new("Task", &format!("task-{}", n)),
        })
    }

    async fn set_task_state(
        &self,
        task: &RemoteTaskRef,
        state: RemoteTaskState,
        fault: Option<&str>,
    ) -> Result<(), RemoteError> {
        if self.fail_set_state.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("connection reset".to_string()));
        }
        match fault {
            Some(fault) => self.record(format!("set_task_state {} {} {}", task.key, state.as_wire(), fault)),
            None => self.record(format!("set_task_state {} {}", task.key, state.as_wire())),
        }
        Ok(())
    }

    async fn set_task_description(
        &self,
        task: &RemoteTaskRef,
        message_key: &str,
        message: &str,
    ) -> Result<(), RemoteError> {
        self.record(format!("set_task_description {} {} {}", task.key, message_key, message));
        Ok(())
    }

    async fn has_privilege(
        &self,
        _session_key: &str,
        entities: &[ManagedObjectRef],
        privilege_id: &str,
    ) -> Result<bool, RemoteError> {
        self.record(format!("has_privilege {} {}", entities.len(), privilege_id));
        Ok(!self.deny_privileges.load(Ordering::SeqCst))
    }
}

/// Hands out a fresh [`FakeRemote`] per connect and remembers all of them.
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    fail_next: Mutex<Option<RemoteError>>,
    clients: Mutex<Vec<Arc<FakeRemote>>>,
}

impl FakeConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, err: RemoteError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn clients(&self) -> Vec<Arc<FakeRemote>> {
        self.clients.lock().unwrap().clone()
    }

    pub fn logouts(&self) -> usize {
        self.clients().iter().map(|c| c.logout_count()).sum()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, _key: &SessionKey) -> Result<RemoteSession, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }

        let client = Arc::new(FakeRemote::default());
        self.clients.lock().unwrap().push(client.clone());
        let user = client
            .login(&DelegatedLogin {
                clone_ticket: "ticket".to_string(),
            })
            .await?;
        Ok(RemoteSession { client, user })
    }
}
