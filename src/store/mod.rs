/// Account store
///
/// Typed access to the shared key-value store holding account records and
/// the time-ordered staging/valid indexes. Backends provide the atomic
/// batches; `AccountStore` owns the record layout and naming.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::{
    account::{now_millis, Account},
    config::ServerEnv,
    error::{PtuError, PtuResult},
    names::NameGenerator,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Which expiry index an email belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Unverified, scored by expiry time
    Staging,
    /// Verified, scored by creation time
    Valid,
}

/// Key names under a configurable prefix
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Counter behind generated emails
    pub fn sequence(&self) -> String {
        format!("{}nextval", self.prefix)
    }

    /// Queue reserved for an external mail-sending process
    ///
    /// Part of the published key layout so such a process can share the
    /// prefix; the service itself never pushes to or pops from it.
    pub fn mail_queue(&self) -> String {
        format!("{}mailq", self.prefix)
    }

    /// List of emails retired by the expiry sweep
    pub fn expired(&self) -> String {
        format!("{}expired", self.prefix)
    }

    pub fn index(&self, kind: IndexKind) -> String {
        match kind {
            IndexKind::Staging => format!("{}emails:staging", self.prefix),
            IndexKind::Valid => format!("{}emails:valid", self.prefix),
        }
    }

    pub fn account(&self, email: &str) -> String {
        format!("{}email:{}", self.prefix, email)
    }
}

/// Key-value backend operations the account store needs
///
/// Every method is one round-trip; the multi-key methods must be atomic.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Atomically increment and return the global sequence
    async fn next_sequence(&self) -> PtuResult<u64>;

    /// Write the record and add the email to the staging index, all or nothing
    async fn stage(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
        expires_at_ms: i64,
    ) -> PtuResult<()>;

    /// All stored fields; empty when the record does not exist
    async fn fields(&self, email: &str) -> PtuResult<HashMap<String, String>>;

    async fn set_fields(&self, email: &str, fields: &[(&'static str, String)]) -> PtuResult<()>;

    /// Write each field the record does not hold yet and return the stored
    /// value of every named field, all or nothing
    async fn claim_fields(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
    ) -> PtuResult<HashMap<String, String>>;

    /// Move the email from staging to valid, drop its token and stamp the
    /// verification time, all or nothing
    async fn promote(&self, email: &str, created_at_ms: i64, verified_at_ms: i64)
        -> PtuResult<()>;

    async fn membership(&self, email: &str) -> PtuResult<Option<IndexKind>>;

    /// Emails in `index` scored at or below `cutoff_ms`, oldest first
    async fn expired(&self, index: IndexKind, cutoff_ms: i64) -> PtuResult<Vec<String>>;

    /// Remove emails from both indexes, delete their records and append them
    /// to the expired list, all or nothing
    async fn retire(&self, emails: &[String]) -> PtuResult<()>;

    async fn ping(&self) -> PtuResult<()>;
}

/// Typed account store
#[derive(Clone)]
pub struct AccountStore {
    backend: Arc<dyn StoreBackend>,
    names: NameGenerator,
    ttl: Duration,
}

impl AccountStore {
    pub fn new(backend: Arc<dyn StoreBackend>, names: NameGenerator, ttl: Duration) -> Self {
        Self {
            backend,
            names,
            ttl,
        }
    }

    /// Reserve the next sequence number and stage a fresh account
    pub async fn allocate(&self, env: ServerEnv, do_verify: bool) -> PtuResult<Account> {
        let sequence = self.backend.next_sequence().await?;
        let now = now_millis();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| PtuError::Validation("account TTL is out of range".to_string()))?;

        let account = Account {
            email: self.names.next_email(sequence),
            password: self.names.random_password(),
            env,
            do_verify,
            verification_context: None,
            verification_token: None,
            created_at: now,
            expires_at,
            verified_at: None,
            public_key: None,
            secret_key: None,
        };

        self.backend
            .stage(
                &account.email,
                &account.to_fields(),
                account.expires_at.timestamp_millis(),
            )
            .await?;

        debug!(email = %account.email, sequence, env = %env, "Staged account");

        Ok(account)
    }

    pub async fn find(&self, email: &str) -> PtuResult<Option<Account>> {
        let map = self.backend.fields(email).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Account::from_fields(map).map(Some)
    }

    pub async fn get(&self, email: &str) -> PtuResult<Account> {
        self.find(email)
            .await?
            .ok_or_else(|| PtuError::NotFound(format!("Account {} not found", email)))
    }

    pub async fn set_field(&self, email: &str, name: &'static str, value: String) -> PtuResult<()> {
        self.set_fields(email, &[(name, value)]).await
    }

    /// Write several fields in one atomic call
    pub async fn set_fields(&self, email: &str, fields: &[(&'static str, String)]) -> PtuResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.backend.set_fields(email, fields).await
    }

    /// Write fields only where the record has none; returns what is stored
    /// afterwards, so concurrent callers all see the first writer's values
    pub async fn claim_fields(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
    ) -> PtuResult<HashMap<String, String>> {
        if fields.is_empty() {
            return Ok(HashMap::new());
        }
        self.backend.claim_fields(email, fields).await
    }

    /// Mark a staged account verified
    pub async fn promote(&self, account: &Account) -> PtuResult<()> {
        self.backend
            .promote(
                &account.email,
                account.created_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            )
            .await?;

        debug!(email = %account.email, "Promoted account to valid index");
        Ok(())
    }

    pub async fn membership(&self, email: &str) -> PtuResult<Option<IndexKind>> {
        self.backend.membership(email).await
    }

    /// Retire staged accounts past their deadline and verified accounts older
    /// than the account lifetime; returns the retired emails
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> PtuResult<Vec<String>> {
        let mut emails = self
            .backend
            .expired(IndexKind::Staging, now.timestamp_millis())
            .await?;
        let valid_cutoff = now
            .checked_sub_signed(self.ttl)
            .map_or(i64::MIN, |cutoff| cutoff.timestamp_millis());
        emails.extend(
            self.backend
                .expired(IndexKind::Valid, valid_cutoff)
                .await?,
        );

        if emails.is_empty() {
            debug!("Expiry sweep: nothing to retire");
            return Ok(emails);
        }

        self.backend.retire(&emails).await?;
        info!(count = emails.len(), "Retired expired accounts");

        Ok(emails)
    }

    pub async fn ping(&self) -> PtuResult<()> {
        self.backend.ping().await
    }
}
