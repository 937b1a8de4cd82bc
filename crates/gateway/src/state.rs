use std::sync::Arc;

use sb_domain::config::Config;
use sb_store::StateStore;
use sb_supervisor::Supervisor;

use crate::runtime::lifecycle::LifecycleController;
use crate::runtime::pool::PoolManager;
use crate::runtime::registry::SessionRegistry;
use crate::runtime::spawn::SpawnQueue;
use crate::token::TokenIssuer;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, state store, process supervisor
/// - **Session lifecycle** — registry, pool, spawn queue, façade
/// - **Security (startup-computed)** — webhook secret, token issuer
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<dyn StateStore>,
    pub supervisor: Arc<Supervisor>,

    // ── Session lifecycle ─────────────────────────────────────────────
    pub registry: Arc<SessionRegistry>,
    pub pool: Arc<PoolManager>,
    pub spawn_queue: SpawnQueue,
    pub lifecycle: Arc<LifecycleController>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// Media-server webhook shared secret (read once at startup).
    /// `None` only when `webhook.allow_unsigned` is set (development).
    pub webhook_secret: Option<Arc<String>>,
    pub tokens: Arc<TokenIssuer>,
}
