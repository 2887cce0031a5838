//! Room endpoints: CRUD, membership, pause/cap updates.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use ag_domain::Error;
use ag_store::cache::{room_agents_key, room_key};
use ag_store::records::RoomRecord;

use super::auth::AuthContext;
use super::{api_error, error_response};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Visibility
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Admins see every room; guests only their own.
pub(crate) fn check_room_visible(identity: &AuthContext, room: &RoomRecord) -> Result<(), Error> {
    if identity.is_admin() || room.owner_id.as_deref() == Some(identity.user_id.as_str()) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "room {} belongs to another owner",
            room.id
        )))
    }
}

pub(crate) async fn visible_room(
    state: &AppState,
    identity: &AuthContext,
    room_id: i64,
) -> Result<RoomRecord, Error> {
    let room = state.orchestrator.room_cached(room_id).await?;
    check_room_visible(identity, &room)?;
    Ok(room)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /rooms
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub world_id: Option<i64>,
    #[serde(default)]
    pub max_interactions: Option<i64>,
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Json(body): Json<CreateRoomRequest>,
) -> Response {
    if body.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "room name must not be empty");
    }
    let owner = identity.user_id.clone();
    let result = state
        .write_queue
        .enqueue(move |store| {
            store.create_room(
                Some(&owner),
                body.name.trim(),
                body.world_id,
                body.max_interactions,
            )
        })
        .await;
    match result {
        Ok(room) => (StatusCode::CREATED, Json(room)).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /rooms, GET /rooms/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
) -> Response {
    let owner = (!identity.is_admin()).then(|| identity.user_id.clone());
    match state.store.list_rooms(owner.as_deref()) {
        Ok(rooms) => Json(rooms).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_room(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    match visible_room(&state, &identity, room_id).await {
        Ok(room) => Json(room).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PATCH /rooms/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UpdateRoomRequest {
    /// Present-and-null clears the cap; absent leaves it untouched.
    #[serde(default, with = "double_option")]
    pub max_interactions: Option<Option<i64>>,
    #[serde(default)]
    pub is_paused: Option<bool>,
}

/// Distinguishes "field absent" from "field set to null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<i64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<i64>::deserialize(de).map(Some)
    }
}

pub async fn update_room(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
    Json(body): Json<UpdateRoomRequest>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }

    if let Some(cap) = body.max_interactions {
        let result = state
            .write_queue
            .enqueue(move |store| store.set_room_max_interactions(room_id, cap))
            .await;
        if let Err(e) = result {
            return error_response(e);
        }
    }
    if let Some(paused) = body.is_paused {
        let result = state
            .write_queue
            .enqueue(move |store| store.set_room_paused(room_id, paused))
            .await;
        if let Err(e) = result {
            return error_response(e);
        }
        if paused {
            // Explicit pause cancels whatever the room is doing.
            state
                .orchestrator
                .interrupt_room_processing(room_id, false)
                .await;
        }
    }
    state.cache.invalidate(&room_key(room_id));

    match state.store.get_room(room_id) {
        Ok(Some(room)) => Json(room).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("room {room_id}")),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /rooms/:id (admin only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delete_room(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    if !identity.is_admin() {
        return api_error(StatusCode::FORBIDDEN, "admin only");
    }
    state.orchestrator.cleanup_room_state(room_id).await;
    let result = state
        .write_queue
        .enqueue(move |store| store.delete_room(room_id))
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /rooms/:id/read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(room_id): Path<i64>,
) -> Response {
    if let Err(e) = visible_room(&state, &identity, room_id).await {
        return error_response(e);
    }
    let now = chrono::Utc::now();
    let result = state
        .write_queue
        .enqueue(move |store| store.mark_room_read(room_id, now))
        .await;
    state.cache.invalidate(&room_key(room_id));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Room membership (admin only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn attach_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path((room_id, agent_id)): Path<(i64, i64)>,
) -> Response {
    if !identity.is_admin() {
        return api_error(StatusCode::FORBIDDEN, "admin only");
    }
    match state.store.get_agent(agent_id) {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("agent {agent_id}")),
        Err(e) => return error_response(e),
    }
    if let Err(e) = state.orchestrator.room_cached(room_id).await {
        return error_response(e);
    }
    let result = state
        .write_queue
        .enqueue(move |store| store.add_agent_to_room(room_id, agent_id))
        .await;
    state.cache.invalidate(&room_agents_key(room_id));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn detach_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path((room_id, agent_id)): Path<(i64, i64)>,
) -> Response {
    if !identity.is_admin() {
        return api_error(StatusCode::FORBIDDEN, "admin only");
    }
    let result = state
        .write_queue
        .enqueue(move |store| store.remove_agent_from_room(room_id, agent_id))
        .await;
    state.cache.invalidate(&room_agents_key(room_id));
    // Its pooled client has no further use in this room.
    state
        .manager
        .pool
        .cleanup(ag_domain::TaskIdentifier::new(room_id, agent_id))
        .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
