use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A chassis record as exchanged with the UI.
///
/// `id` is assigned by the store on create; any value supplied by the
/// client for a create request is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chassis {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dimensions: String,
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, rename = "relatedHostsIds")]
    pub related_host_ids: BTreeSet<String>,
}

/// The local view of a remote host: only the backward half of the
/// chassis relation is owned here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    #[serde(default)]
    pub related_chassis_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ChassisUpdated,
    ChassisRelationChanged,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ChassisUpdated => "CHASSIS_UPDATED",
            MessageType::ChassisRelationChanged => "CHASSIS_RELATION_CHANGED",
        }
    }
}

/// Payload pushed to real-time subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
}

impl ChangeMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self { message_type }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Success,
    Error,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Why a guarded mutation ended in `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    DuplicateName,
    HasActiveRelations,
    NotFound,
    InvalidArgument,
    TaskInfrastructureFailure,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::DuplicateName => "DUPLICATE_NAME",
            FaultKind::HasActiveRelations => "HAS_ACTIVE_RELATIONS",
            FaultKind::NotFound => "NOT_FOUND",
            FaultKind::InvalidArgument => "INVALID_ARGUMENT",
            FaultKind::TaskInfrastructureFailure => "TASK_INFRASTRUCTURE_FAILURE",
        }
    }

    /// Fault type name reported to the remote task manager. The plugin
    /// registration declares these names alongside the task type ids.
    pub fn remote_fault_type(self) -> &'static str {
        match self {
            FaultKind::DuplicateName => "ChassisAlreadyExistsFault",
            FaultKind::HasActiveRelations => "RelatedChassisDeletionFault",
            FaultKind::NotFound => "NotFound",
            FaultKind::InvalidArgument => "InvalidArgument",
            FaultKind::TaskInfrastructureFailure => "SystemError",
        }
    }
}

/// Error-kind token carried by every structured error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BackendUnreachable,
    AuthRejected,
    DuplicateName,
    HasActiveRelations,
    TaskInfrastructureFailure,
    NotFound,
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BackendUnreachable => "BACKEND_UNREACHABLE",
            ErrorKind::AuthRejected => "AUTH_REJECTED",
            ErrorKind::DuplicateName => "DUPLICATE_NAME",
            ErrorKind::HasActiveRelations => "HAS_ACTIVE_RELATIONS",
            ErrorKind::TaskInfrastructureFailure => "TASK_INFRASTRUCTURE_FAILURE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl From<FaultKind> for ErrorKind {
    fn from(value: FaultKind) -> Self {
        match value {
            FaultKind::DuplicateName => ErrorKind::DuplicateName,
            FaultKind::HasActiveRelations => ErrorKind::HasActiveRelations,
            FaultKind::NotFound => ErrorKind::NotFound,
            FaultKind::InvalidArgument => ErrorKind::InvalidRequest,
            FaultKind::TaskInfrastructureFailure => ErrorKind::TaskInfrastructureFailure,
        }
    }
}

/// Task types the plugin registers with the remote extension manager.
/// Creating a remote task with an unregistered id fails on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChassisTaskType {
    Create,
    Update,
    Delete,
}

impl ChassisTaskType {
    pub fn task_type_id(self) -> &'static str {
        match self {
            ChassisTaskType::Create => "com.vmware.sample.remote.1.0.0.CreateChassis",
            ChassisTaskType::Update => "com.vmware.sample.remote.1.0.0.UpdateChassis",
            ChassisTaskType::Delete => "com.vmware.sample.remote.1.0.0.DeleteChassis",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChassisTaskType::Create => "CREATE",
            ChassisTaskType::Update => "UPDATE",
            ChassisTaskType::Delete => "DELETE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chassis_uses_ui_field_names() {
        let chassis = Chassis {
            id: "chassis:1".to_string(),
            name: "Rack-1".to_string(),
            dimensions: "20in x 30in x 17in".to_string(),
            server_type: "Server_Type 1".to_string(),
            is_active: true,
            related_host_ids: BTreeSet::from(["host-9".to_string()]),
        };

        let value = serde_json::to_value(&chassis).expect("chassis should serialize");
        assert_eq!(value["serverType"], "Server_Type 1");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["relatedHostsIds"], serde_json::json!(["host-9"]));
    }

    #[test]
    fn chassis_create_body_defaults_missing_fields() {
        let chassis: Chassis =
            serde_json::from_str(r#"{"name":"Rack-2"}"#).expect("partial body should parse");
        assert!(chassis.id.is_empty());
        assert!(!chassis.is_active);
        assert!(chassis.related_host_ids.is_empty());
    }

    #[test]
    fn change_message_is_tagged_by_type() {
        let json = serde_json::to_string(&ChangeMessage::new(MessageType::ChassisRelationChanged))
            .expect("message should serialize");
        assert_eq!(json, r#"{"type":"CHASSIS_RELATION_CHANGED"}"#);
    }

    #[test]
    fn fault_kinds_map_onto_error_kinds() {
        assert_eq!(
            ErrorKind::from(FaultKind::HasActiveRelations).as_str(),
            FaultKind::HasActiveRelations.as_str()
        );
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
