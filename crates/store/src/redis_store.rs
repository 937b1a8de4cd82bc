//! Redis store backend.
//!
//! One `ConnectionManager` (auto-reconnecting, cheap to clone) serves all
//! operations. Atomicity relies only on single-command semantics: SPOP
//! for pool assignment, SET NX for user claims, INCR+EXPIRE for rate
//! windows. No MULTI/EXEC anywhere.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use sb_domain::{ConfigSnapshot, Session};

use crate::codec;
use crate::keys::{self, LOG_CAP};
use crate::{StateStore, StoreError, StoreResult};

pub struct RedisStore {
    conn: ConnectionManager,
    ttl_secs: i64,
}

impl RedisStore {
    pub async fn connect(url: &str, ttl_secs: u64) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(err)?;
        let conn = ConnectionManager::new(client).await.map_err(err)?;
        Ok(Self {
            conn,
            ttl_secs: ttl_secs as i64,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn err(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put_session(&self, session: &Session) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = keys::session(&session.id);
        let fields = codec::to_fields(session);
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(err)?;
        conn.expire::<_, ()>(&key, self.ttl_secs).await.map_err(err)?;
        Ok(())
    }

    async fn patch_session(&self, id: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(keys::session(id), fields)
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> =
            conn.hgetall(keys::session(id)).await.map_err(err)?;
        Ok(codec::from_fields(&map))
    }

    async fn expire_session(&self, id: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(keys::session(id), ttl_secs as i64)
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn add_to_index(&self, index: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(index, id).await.map_err(err)?;
        Ok(())
    }

    async fn remove_from_index(&self, index: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(index, id).await.map_err(err)?;
        Ok(())
    }

    async fn index_members(&self, index: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.smembers(index).await.map_err(err)
    }

    async fn index_size(&self, index: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        conn.scard(index).await.map_err(err)
    }

    async fn pop_pool_ready(&self) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        conn.spop(keys::INDEX_POOL_READY).await.map_err(err)
    }

    async fn delete_session_and_indexes(&self, id: &str) -> Vec<String> {
        let mut conn = self.conn();
        let mut errors = Vec::new();

        let record_keys = vec![
            keys::session(id),
            keys::session_config(id),
            keys::agent_pid(id),
            keys::agent_logs(id),
        ];
        if let Err(e) = conn.del::<_, ()>(record_keys).await {
            errors.push(format!("del session keys: {e}"));
        }
        for index in [keys::INDEX_READY, keys::INDEX_STARTING, keys::INDEX_POOL_READY] {
            if let Err(e) = conn.srem::<_, _, ()>(index, id).await {
                errors.push(format!("srem {index}: {e}"));
            }
        }
        errors
    }

    async fn rate_limit(&self, bucket: &str, window_secs: u64, max: u32) -> StoreResult<bool> {
        let mut conn = self.conn();
        let key = keys::rate_limit(bucket);
        let count: i64 = conn.incr(&key, 1).await.map_err(err)?;
        if count == 1 {
            conn.expire::<_, ()>(&key, window_secs as i64)
                .await
                .map_err(err)?;
        }
        Ok(count <= i64::from(max))
    }

    async fn put_config(&self, id: &str, snapshot: &ConfigSnapshot) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = keys::session_config(id);
        let mut fields = vec![("voice_id", snapshot.voice_id.clone())];
        if let Some(ref v) = snapshot.opening_line {
            fields.push(("opening_line", v.clone()));
        }
        if let Some(ref v) = snapshot.system_prompt {
            fields.push(("system_prompt", v.clone()));
        }
        conn.hset_multiple::<_, _, _, ()>(&key, &fields)
            .await
            .map_err(err)?;
        conn.expire::<_, ()>(&key, self.ttl_secs).await.map_err(err)?;
        Ok(())
    }

    async fn get_config(&self, id: &str) -> StoreResult<Option<ConfigSnapshot>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn
            .hgetall(keys::session_config(id))
            .await
            .map_err(err)?;
        let Some(voice_id) = map.get("voice_id") else {
            return Ok(None);
        };
        Ok(Some(ConfigSnapshot {
            voice_id: voice_id.clone(),
            opening_line: map.get("opening_line").cloned(),
            system_prompt: map.get("system_prompt").cloned(),
        }))
    }

    async fn claim_user_session(&self, identity: &str, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        // SET NX EX — claimed iff the key did not exist.
        let outcome: Option<String> = redis::cmd("SET")
            .arg(keys::user_session(identity))
            .arg(id)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(err)?;
        Ok(outcome.is_some())
    }

    async fn get_user_session(&self, identity: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        conn.get(keys::user_session(identity)).await.map_err(err)
    }

    async fn release_user_session(&self, identity: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = keys::user_session(identity);
        // Only drop the claim if it still points at this session; a
        // newer claim by the same user must survive our teardown.
        let current: Option<String> = conn.get(&key).await.map_err(err)?;
        if current.as_deref() == Some(id) {
            conn.del::<_, ()>(&key).await.map_err(err)?;
        }
        Ok(())
    }

    async fn put_agent_pid(&self, id: &str, pid: i32) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = keys::agent_pid(id);
        conn.set::<_, _, ()>(&key, pid.to_string())
            .await
            .map_err(err)?;
        conn.expire::<_, ()>(&key, self.ttl_secs).await.map_err(err)?;
        Ok(())
    }

    async fn append_log(&self, id: &str, line: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let key = keys::agent_logs(id);
        conn.rpush::<_, _, ()>(&key, line).await.map_err(err)?;
        conn.ltrim::<_, ()>(&key, -(LOG_CAP as isize), -1)
            .await
            .map_err(err)?;
        conn.expire::<_, ()>(&key, self.ttl_secs).await.map_err(err)?;
        Ok(())
    }

    async fn recent_logs(&self, id: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        conn.lrange(keys::agent_logs(id), 0, -1).await.map_err(err)
    }

    async fn incr_pool_stat(&self, field: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.hincr::<_, _, _, ()>(keys::POOL_STATS, field, 1)
            .await
            .map_err(err)?;
        Ok(())
    }

    async fn pool_target(&self) -> StoreResult<Option<u32>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::POOL_TARGET).await.map_err(err)?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(err)
    }
}
