//! Agent record endpoints.
//!
//! Agents arrive as already-parsed config records (name, prompt, and
//! the markdown-derived sections); there is no filesystem loading here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use ag_store::cache::agent_key;
use ag_store::records::NewAgent;

use super::auth::AuthContext;
use super::{api_error, error_response};
use crate::state::AppState;

pub async fn list_agents(State(state): State<AppState>) -> Response {
    match state.store.list_agents() {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_agent(State(state): State<AppState>, Path(agent_id): Path<i64>) -> Response {
    match state.store.get_agent(agent_id) {
        Ok(Some(agent)) => Json(agent).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("agent {agent_id}")),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub world_name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub in_a_nutshell: Option<String>,
    #[serde(default)]
    pub characteristics: Option<String>,
    #[serde(default)]
    pub recent_events: Option<String>,
    #[serde(default)]
    pub profile_pic: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub interrupt_every_turn: bool,
    #[serde(default)]
    pub transparent: bool,
}

pub async fn create_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Json(body): Json<CreateAgentRequest>,
) -> Response {
    if !identity.is_admin() {
        return api_error(StatusCode::FORBIDDEN, "admin only");
    }
    if body.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "agent name must not be empty");
    }
    if body.system_prompt.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "system prompt must not be empty");
    }

    let record = NewAgent {
        name: body.name.trim().to_owned(),
        world_name: body.world_name,
        group: body.group,
        config_file: None,
        profile_pic: body.profile_pic,
        in_a_nutshell: body.in_a_nutshell,
        characteristics: body.characteristics,
        recent_events: body.recent_events,
        system_prompt: body.system_prompt,
        priority: body.priority,
        interrupt_every_turn: body.interrupt_every_turn,
        transparent: body.transparent,
    };
    let result = state
        .write_queue
        .enqueue(move |store| store.create_agent(&record))
        .await;
    match result {
        Ok(agent) => (StatusCode::CREATED, Json(agent)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateAgentRequest {
    #[serde(default)]
    pub in_a_nutshell: Option<String>,
    #[serde(default)]
    pub characteristics: Option<String>,
    #[serde(default)]
    pub recent_events: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub interrupt_every_turn: Option<bool>,
    #[serde(default)]
    pub transparent: Option<bool>,
}

pub async fn update_agent(
    State(state): State<AppState>,
    Extension(identity): Extension<AuthContext>,
    Path(agent_id): Path<i64>,
    Json(body): Json<UpdateAgentRequest>,
) -> Response {
    if !identity.is_admin() {
        return api_error(StatusCode::FORBIDDEN, "admin only");
    }
    let result = state
        .write_queue
        .enqueue(move |store| {
            store.update_agent_config(
                agent_id,
                body.in_a_nutshell.as_deref(),
                body.characteristics.as_deref(),
                body.recent_events.as_deref(),
                body.system_prompt.as_deref(),
                body.priority,
                body.interrupt_every_turn,
                body.transparent,
            )
        })
        .await;
    // The next turn for this agent sees a changed config hash and the
    // pool replaces its client.
    state.cache.invalidate(&agent_key(agent_id));
    match result {
        Ok(agent) => Json(agent).into_response(),
        Err(e) => error_response(e),
    }
}
