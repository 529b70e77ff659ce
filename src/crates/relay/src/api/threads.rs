//! `GET /threads` - list the caller's threads for resuming.

use crate::auth::Principal;
use crate::error::Result;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ListThreadsQuery {
    /// Optional flow tag filter.
    pub flow: Option<String>,
}

pub async fn list_threads(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<Json<Value>> {
    let threads = state
        .threads
        .list_user_threads(&principal.user_id, query.flow.as_deref())
        .await?;
    Ok(Json(json!({"threads": threads})))
}
