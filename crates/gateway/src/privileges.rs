use rpb_remote::{ManagedObjectRef, RemoteSession};

/// Whether the session's user holds `privilege_id` on every object.
///
/// Object ids use the UI form `urn:vmomi:<Type>:<id>:<serverGuid>`. An
/// unparsable id or any remote failure answers `false`.
pub async fn has_privilege(session: &RemoteSession, object_ids: &[String], privilege_id: &str) -> bool {
    if object_ids.is_empty() || privilege_id.trim().is_empty() {
        return false;
    }

    let mut entities = Vec::with_capacity(object_ids.len());
    for object_id in object_ids {
        match ManagedObjectRef::from_object_id(object_id) {
            Some(entity) => entities.push(entity),
            None => {
                tracing::warn!(object_id = %object_id, "unparsable object id in privilege check");
                return false;
            }
        }
    }

    match session
        .client
        .has_privilege(&session.user.key, &entities, privilege_id)
        .await
    {
        Ok(granted) => granted,
        Err(err) => {
            tracing::warn!(privilege_id, error = %err, "privilege check failed");
            false
        }
    }
}
