/// In-process store backend
///
/// One mutex guards the whole keyspace, so every multi-key operation is
/// trivially atomic. Used for local runs and tests.
use crate::{
    account::fields,
    error::PtuResult,
    store::{IndexKind, StoreBackend},
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Keyspace {
    sequence: u64,
    accounts: HashMap<String, HashMap<String, String>>,
    staging: HashMap<String, i64>,
    valid: HashMap<String, i64>,
    expired: Vec<String>,
}

impl Keyspace {
    fn index(&self, kind: IndexKind) -> &HashMap<String, i64> {
        match kind {
            IndexKind::Staging => &self.staging,
            IndexKind::Valid => &self.valid,
        }
    }
}

/// Memory-backed account store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Keyspace>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emails retired by the sweep, in retirement order
    pub async fn expired_list(&self) -> Vec<String> {
        self.inner.lock().await.expired.clone()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn next_sequence(&self) -> PtuResult<u64> {
        let mut space = self.inner.lock().await;
        space.sequence += 1;
        Ok(space.sequence)
    }

    async fn stage(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
        expires_at_ms: i64,
    ) -> PtuResult<()> {
        let mut space = self.inner.lock().await;
        space.staging.insert(email.to_string(), expires_at_ms);
        let record = space.accounts.entry(email.to_string()).or_default();
        for (name, value) in fields {
            record.insert(name.to_string(), value.clone());
        }
        Ok(())
    }

    async fn fields(&self, email: &str) -> PtuResult<HashMap<String, String>> {
        let space = self.inner.lock().await;
        Ok(space.accounts.get(email).cloned().unwrap_or_default())
    }

    async fn set_fields(&self, email: &str, fields: &[(&'static str, String)]) -> PtuResult<()> {
        let mut space = self.inner.lock().await;
        let record = space.accounts.entry(email.to_string()).or_default();
        for (name, value) in fields {
            record.insert(name.to_string(), value.clone());
        }
        Ok(())
    }

    async fn claim_fields(
        &self,
        email: &str,
        fields: &[(&'static str, String)],
    ) -> PtuResult<HashMap<String, String>> {
        let mut space = self.inner.lock().await;
        let record = space.accounts.entry(email.to_string()).or_default();
        Ok(fields
            .iter()
            .map(|(name, value)| {
                let stored = record
                    .entry(name.to_string())
                    .or_insert_with(|| value.clone())
                    .clone();
                (name.to_string(), stored)
            })
            .collect())
    }

    async fn promote(
        &self,
        email: &str,
        created_at_ms: i64,
        verified_at_ms: i64,
    ) -> PtuResult<()> {
        let mut space = self.inner.lock().await;
        space.staging.remove(email);
        space.valid.insert(email.to_string(), created_at_ms);
        let record = space.accounts.entry(email.to_string()).or_default();
        record.remove(fields::TOKEN);
        record.insert(fields::VERIFIED_AT.to_string(), verified_at_ms.to_string());
        Ok(())
    }

    async fn membership(&self, email: &str) -> PtuResult<Option<IndexKind>> {
        let space = self.inner.lock().await;
        if space.valid.contains_key(email) {
            Ok(Some(IndexKind::Valid))
        } else if space.staging.contains_key(email) {
            Ok(Some(IndexKind::Staging))
        } else {
            Ok(None)
        }
    }

    async fn expired(&self, index: IndexKind, cutoff_ms: i64) -> PtuResult<Vec<String>> {
        let space = self.inner.lock().await;
        let mut due: Vec<(&String, i64)> = space
            .index(index)
            .iter()
            .filter(|(_, score)| **score <= cutoff_ms)
            .map(|(email, score)| (email, *score))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due.into_iter().map(|(email, _)| email.clone()).collect())
    }

    async fn retire(&self, emails: &[String]) -> PtuResult<()> {
        let mut space = self.inner.lock().await;
        for email in emails {
            space.staging.remove(email);
            space.valid.remove(email);
            space.accounts.remove(email);
            space.expired.push(email.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> PtuResult<()> {
        Ok(())
    }
}
