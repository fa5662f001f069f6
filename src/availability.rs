/// Rendezvous between verification notifications and waiting requests
///
/// The notifier writes ready markers; lifecycle requests poll for their own
/// email. One table per service instance, shared through `Arc`.
use crate::metrics;
use crate::verifier::VerificationListener;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// What the notifier reported for an email
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyMarker {
    pub token: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct AvailabilityTable {
    entries: RwLock<HashMap<String, ReadyMarker>>,
}

impl AvailabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ReadyMarker>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ReadyMarker>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `email` is ready; returns false when it already was
    pub fn mark_ready(&self, email: &str, token: Option<String>) -> bool {
        let mut entries = self.write();
        if entries.contains_key(email) {
            debug!(email, "Duplicate ready notification ignored");
            return false;
        }

        entries.insert(
            email.to_string(),
            ReadyMarker {
                token,
                received_at: Utc::now(),
            },
        );
        metrics::AVAILABILITY_TABLE_SIZE.set(entries.len() as i64);
        true
    }

    pub fn is_ready(&self, email: &str) -> bool {
        self.read().contains_key(email)
    }

    pub fn get(&self, email: &str) -> Option<ReadyMarker> {
        self.read().get(email).cloned()
    }

    /// Drop entries for accounts that no longer exist
    pub fn evict(&self, emails: &[String]) -> usize {
        let mut entries = self.write();
        let removed = emails
            .iter()
            .filter(|email| entries.remove(email.as_str()).is_some())
            .count();
        metrics::AVAILABILITY_TABLE_SIZE.set(entries.len() as i64);
        removed
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VerificationListener for AvailabilityTable {
    fn on_ready(&self, email: &str, token: Option<String>) {
        if self.mark_ready(email, token) {
            debug!(email, "Email marked ready");
        }
    }

    fn on_error(&self, detail: &str) {
        error!("Verification notifier error: {}", detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_ready_is_idempotent() {
        let table = AvailabilityTable::new();

        assert!(table.mark_ready("abel1@x.org", Some("first".to_string())));
        assert!(!table.mark_ready("abel1@x.org", Some("second".to_string())));

        assert!(table.is_ready("abel1@x.org"));
        assert_eq!(
            table.get("abel1@x.org").unwrap().token.as_deref(),
            Some("first")
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unknown_email_not_ready() {
        let table = AvailabilityTable::new();
        assert!(!table.is_ready("nobody2@x.org"));
        assert!(table.get("nobody2@x.org").is_none());
    }

    #[test]
    fn test_evict_removes_only_listed_emails() {
        let table = AvailabilityTable::new();
        table.on_ready("a1@x.org", None);
        table.on_ready("b2@x.org", None);

        let removed = table.evict(&["a1@x.org".to_string(), "zz9@x.org".to_string()]);

        assert_eq!(removed, 1);
        assert!(!table.is_ready("a1@x.org"));
        assert!(table.is_ready("b2@x.org"));
    }

    #[test]
    fn test_error_signal_leaves_table_untouched() {
        let table = AvailabilityTable::new();
        table.on_error("socket closed");
        assert!(table.is_empty());
    }

    #[test]
    fn test_tables_are_independent() {
        let first = AvailabilityTable::new();
        let second = AvailabilityTable::new();
        first.on_ready("c3@x.org", None);
        assert!(!second.is_ready("c3@x.org"));
    }
}
