use axum::Json;
use axum::extract::State;

use crate::Gateway;
use crate::tasks::TaskRecord;

/// Most recent tracked tasks, oldest first.
pub(super) async fn list_tasks(State(gateway): State<Gateway>) -> Json<Vec<TaskRecord>> {
    Json(gateway.tasks.recent())
}
