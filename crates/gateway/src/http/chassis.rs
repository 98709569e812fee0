use std::collections::BTreeSet;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use rpb_contracts::{Chassis, ErrorKind, Host};
use rpb_store::StoreError;
use serde::{Deserialize, Serialize};

use super::{ApiError, CallerSession, RequestId, invalid_body, json_error};
use crate::Gateway;
use crate::chassis::MutationError;

fn store_error(request_id: &str, err: &StoreError) -> ApiError {
    let (status, code) = match err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
        StoreError::DuplicateName(_) => (StatusCode::CONFLICT, "ERR_DUPLICATE_NAME"),
        StoreError::HasActiveRelations(_) => (StatusCode::CONFLICT, "ERR_HAS_ACTIVE_RELATIONS"),
        StoreError::InvalidRecord(_) => (StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS"),
    };
    json_error(status, code, err.kind(), err.to_string(), request_id, false)
}

fn mutation_error(request_id: &str, err: &MutationError) -> ApiError {
    match err {
        MutationError::Store(err) => store_error(request_id, err),
        MutationError::Queue(err) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ERR_SHUTTING_DOWN",
            ErrorKind::TaskInfrastructureFailure,
            err.to_string(),
            request_id,
            true,
        ),
    }
}

pub(super) async fn list_chassis(State(gateway): State<Gateway>) -> Json<Vec<Chassis>> {
    Json(gateway.chassis.list())
}

pub(super) async fn get_chassis(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<Chassis>, ApiError> {
    gateway
        .chassis
        .get(&id)
        .map(Json)
        .map_err(|err| store_error(&request_id, &err))
}

pub(super) async fn create_chassis(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(caller): Extension<CallerSession>,
    body: Result<Json<Chassis>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(chassis) = body.map_err(|err| invalid_body(&request_id, err.body_text()))?;

    gateway
        .chassis
        .create(&caller.credential, chassis)
        .map_err(|err| mutation_error(&request_id, &err))?;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn edit_chassis(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(caller): Extension<CallerSession>,
    body: Result<Json<Chassis>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(chassis) = body.map_err(|err| invalid_body(&request_id, err.body_text()))?;
    if chassis.id.trim().is_empty() {
        return Err(invalid_body(&request_id, "id is required"));
    }

    gateway
        .chassis
        .update(&caller.credential, chassis)
        .map_err(|err| mutation_error(&request_id, &err))?;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn delete_chassis(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(caller): Extension<CallerSession>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    gateway
        .chassis
        .delete(&caller.credential, &id)
        .map_err(|err| mutation_error(&request_id, &err))?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub(super) struct DeleteBatchQuery {
    #[serde(default)]
    ids: String,
}

#[derive(Debug, Serialize)]
pub(super) struct DeleteBatchResponse {
    scheduled: Vec<String>,
    missing: Vec<String>,
}

pub(super) async fn delete_chassis_batch(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(caller): Extension<CallerSession>,
    Query(query): Query<DeleteBatchQuery>,
) -> Result<(StatusCode, Json<DeleteBatchResponse>), ApiError> {
    let ids = query
        .ids
        .split(',')
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>();
    if ids.is_empty() {
        return Err(invalid_body(&request_id, "ids must name at least one chassis"));
    }

    let mut response = DeleteBatchResponse {
        scheduled: Vec::new(),
        missing: Vec::new(),
    };
    for id in ids {
        match gateway.chassis.delete(&caller.credential, id) {
            Ok(()) => response.scheduled.push(id.to_string()),
            Err(MutationError::Store(StoreError::NotFound(_))) => {
                response.missing.push(id.to_string())
            }
            Err(err) => return Err(mutation_error(&request_id, &err)),
        }
    }

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RelatedHostsRequest {
    #[serde(rename = "relatedHostsIds")]
    related_host_ids: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct ChangedResponse {
    changed: bool,
}

pub(super) async fn set_chassis_hosts(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(id): Path<String>,
    body: Result<Json<RelatedHostsRequest>, JsonRejection>,
) -> Result<Json<ChangedResponse>, ApiError> {
    let Json(req) = body.map_err(|err| invalid_body(&request_id, err.body_text()))?;

    let changed = gateway
        .chassis
        .set_related_hosts(&id, &req.related_host_ids)
        .map_err(|err| store_error(&request_id, &err))?;
    Ok(Json(ChangedResponse { changed }))
}

pub(super) async fn list_hosts(State(gateway): State<Gateway>) -> Json<Vec<Host>> {
    Json(gateway.chassis.list_hosts())
}

pub(super) async fn related_hosts(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Host>>, ApiError> {
    gateway
        .chassis
        .related_hosts(&id)
        .map(Json)
        .map_err(|err| store_error(&request_id, &err))
}

pub(super) async fn related_chassis(
    State(gateway): State<Gateway>,
    Path(host_id): Path<String>,
) -> Json<Vec<Chassis>> {
    Json(gateway.chassis.related_chassis(&host_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HostRelationRequest {
    related_chassis_ids: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct HostRelationResponse {
    added: Vec<String>,
    removed: Vec<String>,
    unknown: Vec<String>,
}

pub(super) async fn reconcile_host(
    State(gateway): State<Gateway>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(host_id): Path<String>,
    body: Result<Json<HostRelationRequest>, JsonRejection>,
) -> Result<Json<HostRelationResponse>, ApiError> {
    let Json(req) = body.map_err(|err| invalid_body(&request_id, err.body_text()))?;

    let outcome = gateway
        .chassis
        .reconcile_host(&host_id, &req.related_chassis_ids);
    Ok(Json(HostRelationResponse {
        added: outcome.added,
        removed: outcome.removed,
        unknown: outcome.unknown,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PrivilegeRequest {
    object_ids: Vec<String>,
    privilege_id: String,
}

#[derive(Debug, Serialize)]
pub(super) struct PrivilegeResponse {
    granted: bool,
}

pub(super) async fn check_privileges(
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(caller): Extension<CallerSession>,
    body: Result<Json<PrivilegeRequest>, JsonRejection>,
) -> Result<Json<PrivilegeResponse>, ApiError> {
    let Json(req) = body.map_err(|err| invalid_body(&request_id, err.body_text()))?;

    let granted =
        crate::privileges::has_privilege(&caller.session, &req.object_ids, &req.privilege_id)
            .await;
    Ok(Json(PrivilegeResponse { granted }))
}
