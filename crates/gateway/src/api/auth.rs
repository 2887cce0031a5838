//! Authentication: password login, signed access tokens, middleware.
//!
//! Tokens are HMAC-SHA256 signed: `hex(payload_json) + "." + hex(mac)`
//! with claims `{user_id, role, exp, iat, type}`. Clients send them in
//! the `X-API-Key` header. Passwords are configured as SHA-256 hex
//! digests and compared in constant time.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use ag_domain::config::AuthConfig;
use ag_domain::types::UserRole;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Paths reachable without a token. `/rooms/{id}/stream` authenticates
/// with a single-use ticket instead (see the tickets module).
const BYPASS_PREFIXES: [&str; 6] = [
    "/auth/login",
    "/auth/health",
    "/docs",
    "/openapi",
    "/assets",
    "/mcp",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Claims & identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    user_id: String,
    role: UserRole,
    exp: i64,
    iat: i64,
    #[serde(rename = "type")]
    token_type: String,
}

/// Authenticated caller identity, injected into request extensions by
/// the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub role: UserRole,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token signer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TokenSigner {
    secret: Vec<u8>,
    ttl_hours: u64,
    admin_password_hash: Option<Vec<u8>>,
    guest_password_hash: Option<Vec<u8>>,
    enable_guest_login: bool,
}

impl TokenSigner {
    /// Build from config. An empty configured secret gets a random one
    /// (tokens then expire with the process).
    pub fn from_config(auth: &AuthConfig) -> Self {
        let secret = if auth.token_secret.is_empty() {
            tracing::warn!("no token secret configured — generating an ephemeral one");
            let mut bytes = vec![0u8; 32];
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        } else {
            auth.token_secret.as_bytes().to_vec()
        };
        Self {
            secret,
            ttl_hours: auth.token_ttl_hours,
            admin_password_hash: hex::decode(&auth.admin_password_hash).ok(),
            guest_password_hash: auth
                .guest_password_hash
                .as_deref()
                .and_then(|h| hex::decode(h).ok()),
            enable_guest_login: auth.enable_guest_login,
        }
    }

    /// Check a plaintext password and return the matched role.
    pub fn authenticate(&self, password: &str) -> Option<UserRole> {
        let digest = Sha256::digest(password.as_bytes());
        if let Some(expected) = &self.admin_password_hash {
            if bool::from(digest.ct_eq(expected.as_slice())) {
                return Some(UserRole::Admin);
            }
        }
        if self.enable_guest_login {
            if let Some(expected) = &self.guest_password_hash {
                if bool::from(digest.ct_eq(expected.as_slice())) {
                    return Some(UserRole::Guest);
                }
            }
        }
        None
    }

    /// Mint an access token for a user.
    pub fn issue(&self, user_id: &str, role: UserRole) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_owned(),
            role,
            exp: now + (self.ttl_hours as i64) * 3600,
            iat: now,
            token_type: "access_token".into(),
        };
        let payload = hex::encode(serde_json::to_vec(&claims).expect("claims serialize"));
        let signature = self.sign(payload.as_bytes());
        format!("{payload}.{signature}")
    }

    /// Verify a token: signature, expiry, and token type.
    pub fn verify(&self, token: &str) -> Option<AuthContext> {
        let (payload, signature) = token.split_once('.')?;
        let expected = self.sign(payload.as_bytes());
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return None;
        }
        let claims: Claims = serde_json::from_slice(&hex::decode(payload).ok()?).ok()?;
        if claims.token_type != "access_token" {
            return None;
        }
        if claims.exp <= chrono::Utc::now().timestamp() {
            return None;
        }
        Some(AuthContext {
            user_id: claims.user_id,
            role: claims.role,
        })
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /auth/login
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let Some(role) = state.token_signer.authenticate(&body.password) else {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid password" })),
        )
            .into_response();
    };
    let user_id = match role {
        UserRole::Admin => "admin",
        UserRole::Guest => "guest",
    };
    let token = state.token_signer.issue(user_id, role);
    tracing::info!(user_id, role = role.as_str(), "login succeeded");
    Json(serde_json::json!({
        "token": token,
        "role": role.as_str(),
        "user_id": user_id,
    }))
    .into_response()
}

/// GET /auth/health — liveness probe.
pub async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Require a valid `X-API-Key` token on every request outside the
/// bypass list, and stash the caller identity in request extensions.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if is_bypassed(req.uri().path(), req.method()) {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(identity) = state.token_signer.verify(token) else {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
    };
    req.extensions_mut().insert(identity);
    next.run(req).await
}

fn is_bypassed(path: &str, method: &Method) -> bool {
    if method == Method::OPTIONS {
        return true;
    }
    if BYPASS_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return true;
    }
    // SSE connections authenticate with a single-use ticket.
    path.starts_with("/rooms/") && path.ends_with("/stream")
}
