/// Redis store backend
///
/// Multi-key writes run as MULTI/EXEC pipelines so the allocation batch,
/// promotion and retirement are all-or-nothing on the server side.
use crate::{
    account::fields,
    error::{PtuError, PtuResult},
    store::{IndexKind, KeyLayout, StoreBackend},
};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Redis-backed account store
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    keys: KeyLayout,
}

fn store_error(op: &str, key: &str, e: RedisError) -> PtuError {
    warn!("Redis {} failed for {}: {}", op, key, e);
    PtuError::Store(format!("{} {} failed: {}", op, key, e))
}

impl RedisBackend {
    /// Connect to Redis
    pub async fn connect(redis_url: &str, key_prefix: &str) -> PtuResult<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            PtuError::Store(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            PtuError::Store(format!("Redis connection failed: {}", e))
        })?;

        info!("✓ Redis connection established");

        Ok(Self {
            connection,
            keys: KeyLayout::new(key_prefix),
        })
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn next_sequence(&self) -> PtuResult<u64> {
        let key = self.keys.sequence();
        let mut conn = self.connection.clone();

        conn.incr(&key, 1u64)
            .await
            .map_err(|e| store_error("INCR", &key, e))
    }

    async fn stage(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
        expires_at_ms: i64,
    ) -> PtuResult<()> {
        let account_key = self.keys.account(email);
        let mut conn = self.connection.clone();

        debug!("Redis MULTI stage: {}", account_key);

        let _: () = ::redis::pipe()
            .atomic()
            .zadd(self.keys.index(IndexKind::Staging), email, expires_at_ms)
            .ignore()
            .hset_multiple(&account_key, fields)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("MULTI stage", &account_key, e))?;

        Ok(())
    }

    async fn fields(&self, email: &str) -> PtuResult<HashMap<String, String>> {
        let account_key = self.keys.account(email);
        let mut conn = self.connection.clone();

        conn.hgetall(&account_key)
            .await
            .map_err(|e| store_error("HGETALL", &account_key, e))
    }

    async fn set_fields(&self, email: &str, fields: &[(&'static str, String)]) -> PtuResult<()> {
        let account_key = self.keys.account(email);
        let mut conn = self.connection.clone();

        let _: () = conn
            .hset_multiple(&account_key, fields)
            .await
            .map_err(|e| store_error("HSET", &account_key, e))?;

        Ok(())
    }

    async fn claim_fields(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
    ) -> PtuResult<HashMap<String, String>> {
        let account_key = self.keys.account(email);
        let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
        let mut conn = self.connection.clone();

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (name, value) in fields {
            pipe.hset_nx(&account_key, *name, value).ignore();
        }
        pipe.cmd("HMGET").arg(&account_key).arg(&names);

        let (stored,): (Vec<Option<String>>,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("MULTI HSETNX", &account_key, e))?;

        Ok(names
            .into_iter()
            .zip(stored)
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect())
    }

    async fn promote(
        &self,
        email: &str,
        created_at_ms: i64,
        verified_at_ms: i64,
    ) -> PtuResult<()> {
        let account_key = self.keys.account(email);
        let mut conn = self.connection.clone();

        let _: () = ::redis::pipe()
            .atomic()
            .zrem(self.keys.index(IndexKind::Staging), email)
            .ignore()
            .zadd(self.keys.index(IndexKind::Valid), email, created_at_ms)
            .ignore()
            .hdel(&account_key, fields::TOKEN)
            .ignore()
            .hset(&account_key, fields::VERIFIED_AT, verified_at_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("MULTI promote", &account_key, e))?;

        Ok(())
    }

    async fn membership(&self, email: &str) -> PtuResult<Option<IndexKind>> {
        let mut conn = self.connection.clone();

        let (staging, valid): (Option<f64>, Option<f64>) = ::redis::pipe()
            .zscore(self.keys.index(IndexKind::Staging), email)
            .zscore(self.keys.index(IndexKind::Valid), email)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("ZSCORE", email, e))?;

        Ok(match (staging, valid) {
            (_, Some(_)) => Some(IndexKind::Valid),
            (Some(_), None) => Some(IndexKind::Staging),
            (None, None) => None,
        })
    }

    async fn expired(&self, index: IndexKind, cutoff_ms: i64) -> PtuResult<Vec<String>> {
        let key = self.keys.index(index);
        let mut conn = self.connection.clone();

        conn.zrangebyscore(&key, "-inf", cutoff_ms)
            .await
            .map_err(|e| store_error("ZRANGEBYSCORE", &key, e))
    }

    async fn retire(&self, emails: &[String]) -> PtuResult<()> {
        if emails.is_empty() {
            return Ok(());
        }

        let staging = self.keys.index(IndexKind::Staging);
        let valid = self.keys.index(IndexKind::Valid);
        let expired = self.keys.expired();

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for email in emails {
            pipe.zrem(&staging, email)
                .ignore()
                .zrem(&valid, email)
                .ignore()
                .del(self.keys.account(email))
                .ignore()
                .rpush(&expired, email)
                .ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("MULTI retire", &expired, e))?;

        Ok(())
    }

    async fn ping(&self) -> PtuResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("PING", "-", e))?;

        if pong != "PONG" {
            return Err(PtuError::Store(
                "Unexpected Redis PING response".to_string(),
            ));
        }

        Ok(())
    }
}
