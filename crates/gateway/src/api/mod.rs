pub mod agents;
pub mod auth;
pub mod messages;
pub mod rooms;
pub mod stream;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};

use ag_domain::Error;

use crate::state::AppState;

/// Build the full API router.
///
/// Every route passes through the `X-API-Key` middleware; the bypass
/// list inside it exempts login, health, and the ticket-authenticated
/// SSE stream.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // Auth (public)
        .route("/auth/login", post(auth::login))
        .route("/auth/health", get(auth::health))
        // Rooms
        .route("/rooms", post(rooms::create_room))
        .route("/rooms", get(rooms::list_rooms))
        .route("/rooms/:id", get(rooms::get_room))
        .route("/rooms/:id", patch(rooms::update_room))
        .route("/rooms/:id", delete(rooms::delete_room))
        .route("/rooms/:id/read", post(rooms::mark_read))
        .route("/rooms/:id/agents/:agent_id", post(rooms::attach_agent))
        .route("/rooms/:id/agents/:agent_id", delete(rooms::detach_agent))
        // Messages
        .route("/rooms/:id/messages/send", post(messages::send_message))
        .route("/rooms/:id/messages", get(messages::get_history))
        .route("/rooms/:id/messages/poll", get(messages::poll_messages))
        .route("/rooms/:id/messages", delete(messages::clear_messages))
        // Streaming
        .route("/rooms/:id/stream/ticket", post(stream::create_ticket))
        .route("/rooms/:id/stream", get(stream::stream_events))
        // Agents
        .route("/agents", get(agents::list_agents))
        .route("/agents", post(agents::create_agent))
        .route("/agents/:id", get(agents::get_agent))
        .route("/agents/:id", patch(agents::update_agent))
        .layer(middleware::from_fn_with_state(state, auth::require_api_key))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto the HTTP surface.
pub(crate) fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "internal error on API path");
    }
    api_error(status, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::Auth("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error_response(error).status(), expected);
        }
    }
}
