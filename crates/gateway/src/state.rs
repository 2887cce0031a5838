use std::sync::Arc;

use ag_domain::config::Config;
use ag_store::{Cache, Store, WriteQueue};

use crate::api::auth::TokenSigner;
use crate::runtime::events::EventBroadcaster;
use crate::runtime::manager::AgentManager;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::tickets::SseTicketManager;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, store, write queue, cache
/// - **Streaming** — broadcaster, SSE tickets
/// - **Orchestration** — agent manager, orchestrator
/// - **Security** — token signer
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Store,
    pub write_queue: Arc<WriteQueue>,
    pub cache: Arc<Cache>,

    // ── Streaming ─────────────────────────────────────────────────────
    pub broadcaster: Arc<EventBroadcaster>,
    pub tickets: Arc<SseTicketManager>,

    // ── Orchestration ─────────────────────────────────────────────────
    pub manager: Arc<AgentManager>,
    pub orchestrator: Arc<Orchestrator>,

    // ── Security ──────────────────────────────────────────────────────
    pub token_signer: Arc<TokenSigner>,
}
