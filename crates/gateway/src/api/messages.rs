//! Message endpoints: send (starts a tape), history, poll, clear.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use ag_domain::types::{ImageAttachment, ParticipantType};
use ag_store::cache::{room_key, room_messages_key};

use super::auth::AuthContext;
use super::rooms::visible_room;
use super::{api_error, error_response};
use crate::runtime::orchestrator::UserMessageInput;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /rooms/:id/messages/send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Only "user" is accepted on this path.
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_participant")]
    pub participant_type: ParticipantType,
    #[serde(default)]
    pub participant_name: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<ImageAttachment>>,
}

fn default_role() -> String {
    "user".into()
}

fn default_participant() -> ParticipantType {
    ParticipantType::User
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    if body.role != "user" {
        return api_error(StatusCode::BAD_REQUEST, "only user messages can be sent");
    }
    if body.content.trim().is_empty() && body.images.as_ref().map_or(true, Vec::is_empty) {
        return api_error(StatusCode::BAD_REQUEST, "message must carry text or images");
    }
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }

    let input = UserMessageInput {
        content: body.content,
        participant_type: body.participant_type,
        participant_name: body.participant_name,
        images: body.images,
    };
    match state
        .orchestrator
        .handle_user_message(room_id, input, None)
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(message)).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /rooms/:id/messages, GET /rooms/:id/messages/poll
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_history(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }
    match state.store.get_messages(room_id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub since_id: i64,
}

pub async fn poll_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
    Query(query): Query<PollQuery>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }
    match state.store.poll_messages(room_id, query.since_id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /rooms/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn clear_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }
    // Stop any in-flight generation before wiping history.
    state
        .orchestrator
        .interrupt_room_processing(room_id, false)
        .await;
    let result = state
        .write_queue
        .enqueue(move |store| {
            store.delete_messages(room_id)?;
            store.set_room_finished(room_id, false)
        })
        .await;
    state.cache.invalidate(&room_messages_key(room_id));
    state.cache.invalidate(&room_key(room_id));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
