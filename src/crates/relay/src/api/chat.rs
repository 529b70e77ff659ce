//! `POST /chat` - multipart in, SSE out.

use crate::auth::Principal;
use crate::error::{RelayError, Result};
use crate::flows::FLOW_CHAT;
use crate::state::AppState;
use crate::threads::derive_title;
use axum::extract::{Multipart, State};
use axum::response::Response;
use axum::Extension;
use flowgraph_core::Message;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::sse::sse_response;

/// Start or continue a chat thread. Multipart fields: `message` (required),
/// `thread_id` (optional), plus any number of file parts, which are accepted
/// and ignored by this surface.
pub async fn chat(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut message: Option<String> = None;
    let mut thread_id: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::Validation(format!("bad multipart body: {e}")))?
    {
        match field.name() {
            Some("message") => {
                message = Some(field.text().await.map_err(|e| {
                    RelayError::Validation(format!("unreadable message field: {e}"))
                })?);
            }
            Some("thread_id") => {
                thread_id = Some(field.text().await.map_err(|e| {
                    RelayError::Validation(format!("unreadable thread_id field: {e}"))
                })?);
            }
            _ => {
                // file uploads are consumed and left to the storage surface
                let _ = field.bytes().await;
            }
        }
    }

    let message = message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::Validation("message is required".into()))?;

    let flow_tag = state.settings.flows.chat_flow_tag.clone();
    state.policy.authorize_flow_tag(&principal.email, &flow_tag)?;

    let thread_id = match thread_id.filter(|id| !id.is_empty()) {
        Some(id) => Uuid::parse_str(&id)
            .map_err(|_| RelayError::Validation(format!("invalid thread_id: {id}")))?
            .to_string(),
        None => Uuid::new_v4().to_string(),
    };

    state.cancel.reset(&thread_id);
    let title = derive_title(&message);
    state
        .threads
        .upsert_thread(&thread_id, &principal.user_id, Some(&title), Some(&flow_tag))
        .await?;
    state.gateway.metrics().init_execution(&thread_id);

    info!(thread_id, user_id = %principal.user_id, "starting chat turn");

    let flow = state.flows.get(FLOW_CHAT)?;
    let input = json!({"messages": [Message::human(message)]});
    let stream = state.start_stream(FLOW_CHAT, flow, &thread_id, Some(input), None, Value::Null);
    Ok(sse_response(stream))
}
