//! In-process store backend.
//!
//! Single-node stand-in for Redis with the same per-op atomicity: one
//! mutex guards all state, so every trait operation is atomic by
//! construction. Record TTLs are not simulated (a test process does not
//! live long enough to care); rate-limit windows are, via `Instant`
//! arithmetic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use sb_domain::{ConfigSnapshot, Session};

use crate::codec;
use crate::keys::{self, LOG_CAP};
use crate::{StateStore, StoreResult};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, HashMap<String, String>>,
    indexes: HashMap<String, HashSet<String>>,
    configs: HashMap<String, ConfigSnapshot>,
    user_claims: HashMap<String, String>,
    agent_pids: HashMap<String, i32>,
    logs: HashMap<String, VecDeque<String>>,
    rate_windows: HashMap<String, (Instant, u32)>,
    pool_stats: HashMap<String, u64>,
    pool_target: Option<u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: set the `pool:target` override.
    pub fn set_pool_target(&self, target: Option<u32>) {
        self.inner.lock().pool_target = target;
    }

    /// Test hook: read a `pool:stats` counter.
    pub fn pool_stat(&self, field: &str) -> u64 {
        self.inner
            .lock()
            .pool_stats
            .get(field)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_session(&self, session: &Session) -> StoreResult<()> {
        let fields = codec::to_fields(session).into_iter().collect();
        self.inner.lock().sessions.insert(session.id.clone(), fields);
        Ok(())
    }

    async fn patch_session(&self, id: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(hash) = inner.sessions.get_mut(id) {
            for (field, value) in fields {
                hash.insert((*field).to_string(), value.clone());
            }
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get(id)
            .and_then(codec::from_fields))
    }

    async fn expire_session(&self, _id: &str, _ttl_secs: u64) -> StoreResult<()> {
        // TTLs are not simulated in the in-process backend.
        Ok(())
    }

    async fn add_to_index(&self, index: &str, id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(())
    }

    async fn remove_from_index(&self, index: &str, id: &str) -> StoreResult<()> {
        if let Some(set) = self.inner.lock().indexes.get_mut(index) {
            set.remove(id);
        }
        Ok(())
    }

    async fn index_members(&self, index: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .indexes
            .get(index)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn index_size(&self, index: &str) -> StoreResult<usize> {
        Ok(self
            .inner
            .lock()
            .indexes
            .get(index)
            .map(|s| s.len())
            .unwrap_or(0))
    }

    async fn pop_pool_ready(&self) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        let Some(set) = inner.indexes.get_mut(keys::INDEX_POOL_READY) else {
            return Ok(None);
        };
        let Some(id) = set.iter().next().cloned() else {
            return Ok(None);
        };
        set.remove(&id);
        Ok(Some(id))
    }

    async fn delete_session_and_indexes(&self, id: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.sessions.remove(id);
        inner.configs.remove(id);
        inner.agent_pids.remove(id);
        inner.logs.remove(id);
        for index in [keys::INDEX_READY, keys::INDEX_STARTING, keys::INDEX_POOL_READY] {
            if let Some(set) = inner.indexes.get_mut(index) {
                set.remove(id);
            }
        }
        Vec::new()
    }

    async fn rate_limit(&self, bucket: &str, window_secs: u64, max: u32) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);
        let entry = inner
            .rate_windows
            .entry(bucket.to_string())
            .or_insert((now, 0));
        if now.duration_since(entry.0) >= window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        Ok(entry.1 <= max)
    }

    async fn put_config(&self, id: &str, snapshot: &ConfigSnapshot) -> StoreResult<()> {
        self.inner
            .lock()
            .configs
            .insert(id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn get_config(&self, id: &str) -> StoreResult<Option<ConfigSnapshot>> {
        Ok(self.inner.lock().configs.get(id).cloned())
    }

    async fn claim_user_session(&self, identity: &str, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.user_claims.get(identity) {
            Some(_) => Ok(false),
            None => {
                inner
                    .user_claims
                    .insert(identity.to_string(), id.to_string());
                Ok(true)
            }
        }
    }

    async fn get_user_session(&self, identity: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.lock().user_claims.get(identity).cloned())
    }

    async fn release_user_session(&self, identity: &str, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.user_claims.get(identity).map(String::as_str) == Some(id) {
            inner.user_claims.remove(identity);
        }
        Ok(())
    }

    async fn put_agent_pid(&self, id: &str, pid: i32) -> StoreResult<()> {
        self.inner.lock().agent_pids.insert(id.to_string(), pid);
        Ok(())
    }

    async fn append_log(&self, id: &str, line: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let buf = inner.logs.entry(id.to_string()).or_default();
        buf.push_back(line.to_string());
        while buf.len() > LOG_CAP {
            buf.pop_front();
        }
        Ok(())
    }

    async fn recent_logs(&self, id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .logs
            .get(id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr_pool_stat(&self, field: &str) -> StoreResult<()> {
        *self
            .inner
            .lock()
            .pool_stats
            .entry(field.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn pool_target(&self) -> StoreResult<Option<u32>> {
        Ok(self.inner.lock().pool_target)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::SessionStatus;

    fn snapshot(voice: &str) -> ConfigSnapshot {
        ConfigSnapshot {
            voice_id: voice.into(),
            opening_line: None,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn put_get_patch_session() {
        let store = MemoryStore::new();
        let s = Session::new("s1", "alice", snapshot("Craig"));
        store.put_session(&s).await.unwrap();

        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Starting);

        store
            .patch_session("s1", &[(codec::fields::STATUS, "ready".into())])
            .await
            .unwrap();
        let got = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Ready);
    }

    #[tokio::test]
    async fn pop_pool_ready_pops_each_id_once() {
        let store = MemoryStore::new();
        store.add_to_index(keys::INDEX_POOL_READY, "a").await.unwrap();
        store.add_to_index(keys::INDEX_POOL_READY, "b").await.unwrap();

        let first = store.pop_pool_ready().await.unwrap().unwrap();
        let second = store.pop_pool_ready().await.unwrap().unwrap();
        assert_ne!(first, second);
        assert!(store.pop_pool_ready().await.unwrap().is_none());
        assert_eq!(store.index_size(keys::INDEX_POOL_READY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_clears_record_and_all_indexes() {
        let store = MemoryStore::new();
        let s = Session::new("s1", "alice", snapshot("Craig"));
        store.put_session(&s).await.unwrap();
        store.put_config("s1", &snapshot("Craig")).await.unwrap();
        store.add_to_index(keys::INDEX_STARTING, "s1").await.unwrap();
        store.add_to_index(keys::INDEX_READY, "s1").await.unwrap();
        store.append_log("s1", "line").await.unwrap();

        let errors = store.delete_session_and_indexes("s1").await;
        assert!(errors.is_empty());
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(store.get_config("s1").await.unwrap().is_none());
        assert_eq!(store.index_size(keys::INDEX_STARTING).await.unwrap(), 0);
        assert_eq!(store.index_size(keys::INDEX_READY).await.unwrap(), 0);
        assert!(store.recent_logs("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_claim_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.claim_user_session("alice", "s1").await.unwrap());
        assert!(!store.claim_user_session("alice", "s2").await.unwrap());
        assert_eq!(
            store.get_user_session("alice").await.unwrap().as_deref(),
            Some("s1")
        );

        // Releasing with a stale id is a no-op.
        store.release_user_session("alice", "s2").await.unwrap();
        assert!(store.get_user_session("alice").await.unwrap().is_some());

        store.release_user_session("alice", "s1").await.unwrap();
        assert!(store.get_user_session("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limit_counts_within_window() {
        let store = MemoryStore::new();
        for _ in 0..10 {
            assert!(store.rate_limit("ip:1.2.3.4", 60, 10).await.unwrap());
        }
        assert!(!store.rate_limit("ip:1.2.3.4", 60, 10).await.unwrap());
        // A different bucket has its own window.
        assert!(store.rate_limit("ip:5.6.7.8", 60, 10).await.unwrap());
    }

    #[tokio::test]
    async fn log_mirror_is_capped() {
        let store = MemoryStore::new();
        for i in 0..150 {
            store.append_log("s1", &format!("line {i}")).await.unwrap();
        }
        let logs = store.recent_logs("s1").await.unwrap();
        assert_eq!(logs.len(), LOG_CAP);
        assert_eq!(logs[0], "line 50");
        assert_eq!(logs[99], "line 149");
    }

    #[tokio::test]
    async fn pool_stats_accumulate() {
        let store = MemoryStore::new();
        store.incr_pool_stat("total_spawned").await.unwrap();
        store.incr_pool_stat("total_spawned").await.unwrap();
        store.incr_pool_stat("total_assigned").await.unwrap();
        assert_eq!(store.pool_stat("total_spawned"), 2);
        assert_eq!(store.pool_stat("total_assigned"), 1);
    }
}
