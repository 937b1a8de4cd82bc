//! State Store Adapter — typed accessors over the shared key-value store.
//!
//! Session records live as hashes with field-level patching, index
//! membership lives in sets with an atomic pop, and rate limiting uses
//! the INCR+EXPIRE idiom. Every operation is individually atomic at the
//! store; there are **no** multi-key transactions — callers order their
//! mutations so intermediate states stay safe.
//!
//! Two backends sit behind one trait: [`MemoryStore`] for tests and
//! single-node development, [`RedisStore`] for production.

pub mod codec;
pub mod keys;
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;

use sb_domain::config::StoreConfig;
use sb_domain::{ConfigSnapshot, Session};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All store failures collapse to one kind; callers pick between
/// degrade and propagate.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for sb_domain::Error {
    fn from(e: StoreError) -> Self {
        sb_domain::Error::StoreUnavailable(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed operations over the shared store. Index names are the constants
/// in [`keys`]; field names for patching are in [`codec::fields`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write the full record and apply its TTL. Does **not** touch
    /// index sets.
    async fn put_session(&self, session: &Session) -> StoreResult<()>;

    /// Partial update; atomic per field.
    async fn patch_session(&self, id: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;

    /// Shorten the record's TTL. Error records linger briefly so a
    /// polling caller can read the failure, then expire on their own.
    async fn expire_session(&self, id: &str, ttl_secs: u64) -> StoreResult<()>;

    async fn add_to_index(&self, index: &str, id: &str) -> StoreResult<()>;
    async fn remove_from_index(&self, index: &str, id: &str) -> StoreResult<()>;
    async fn index_members(&self, index: &str) -> StoreResult<Vec<String>>;
    async fn index_size(&self, index: &str) -> StoreResult<usize>;

    /// Atomically pop an arbitrary member of `pool-ready`. This is the
    /// linearisation point for pool assignment: two racing callers
    /// cannot both receive the same id.
    async fn pop_pool_ready(&self) -> StoreResult<Option<String>>;

    /// Best-effort multi-key cleanup of the record, config snapshot,
    /// pid mirror, log mirror, and all index memberships. Returns the
    /// errors encountered; never fails as a whole.
    async fn delete_session_and_indexes(&self, id: &str) -> Vec<String>;

    /// INCR+EXPIRE window counter. Returns whether the caller is still
    /// under `max` for the current window.
    async fn rate_limit(&self, bucket: &str, window_secs: u64, max: u32) -> StoreResult<bool>;

    /// Config snapshot under `session:{id}:config`, keyed by session id
    /// so concurrent sessions of one user cannot overwrite each other.
    async fn put_config(&self, id: &str, snapshot: &ConfigSnapshot) -> StoreResult<()>;
    async fn get_config(&self, id: &str) -> StoreResult<Option<ConfigSnapshot>>;

    /// SET-NX claim of `user:{identity}:session`. Returns false when a
    /// different live session already holds the claim.
    async fn claim_user_session(&self, identity: &str, id: &str) -> StoreResult<bool>;
    async fn get_user_session(&self, identity: &str) -> StoreResult<Option<String>>;
    /// Release the claim, but only if it still points at `id`.
    async fn release_user_session(&self, identity: &str, id: &str) -> StoreResult<()>;

    /// Fast-lookup mirror of the record's pid field (`agent:{id}:pid`).
    async fn put_agent_pid(&self, id: &str, pid: i32) -> StoreResult<()>;

    /// Capped recent-output mirror (`agent:{id}:logs`, ≤ 100 lines).
    async fn append_log(&self, id: &str, line: &str) -> StoreResult<()>;
    async fn recent_logs(&self, id: &str) -> StoreResult<Vec<String>>;

    /// `pool:stats` counters (`total_spawned`, `total_assigned`).
    async fn incr_pool_stat(&self, field: &str) -> StoreResult<()>;
    /// Runtime override of the pool target (`pool:target`), if set.
    async fn pool_target(&self) -> StoreResult<Option<u32>>;

    async fn ping(&self) -> StoreResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Select a backend from the URL scheme: `memory://` for the in-process
/// store, anything else is handed to the Redis client.
pub async fn create_store(cfg: &StoreConfig, ttl_secs: u64) -> StoreResult<Arc<dyn StateStore>> {
    let url = cfg.effective_url();
    if url.starts_with("memory://") {
        tracing::info!("state store: in-memory (single node)");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        let store = RedisStore::connect(&url, ttl_secs).await?;
        tracing::info!(url = %url, ttl_secs, "state store: redis");
        Ok(Arc::new(store))
    }
}
