/// Disposable test accounts
///
/// Handles the account record, its stored field layout, the views handed
/// back to callers, and the lifecycle manager that issues accounts.

mod manager;

pub use manager::{AccountManager, LifecycleState};

use crate::config::ServerEnv;
use crate::error::{PtuError, PtuResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field names of an account record in the store
pub mod fields {
    pub const EMAIL: &str = "email";
    pub const PASSWORD: &str = "pass";
    pub const ENV: &str = "env";
    pub const DO_VERIFY: &str = "do_verify";
    pub const CONTEXT: &str = "context";
    pub const TOKEN: &str = "token";
    pub const CREATED_AT: &str = "created";
    pub const EXPIRES_AT: &str = "expires";
    pub const VERIFIED_AT: &str = "verified";
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const SECRET_KEY: &str = "secretKey";
}

/// One disposable test identity
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub email: String,
    /// Plaintext on purpose: accounts are disposable test fixtures
    pub password: String,
    pub env: ServerEnv,
    pub do_verify: bool,
    /// Opaque IdP state needed to cancel the remote account
    pub verification_context: Option<serde_json::Value>,
    /// Present only while the account is unverified
    pub verification_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Account {
    /// Stored field map, omitting absent optional fields
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (fields::EMAIL, self.email.clone()),
            (fields::PASSWORD, self.password.clone()),
            (fields::ENV, self.env.to_string()),
            (fields::DO_VERIFY, if self.do_verify { "yes" } else { "no" }.to_string()),
            (fields::CREATED_AT, self.created_at.timestamp_millis().to_string()),
            (fields::EXPIRES_AT, self.expires_at.timestamp_millis().to_string()),
        ];

        if let Some(ref context) = self.verification_context {
            out.push((fields::CONTEXT, context.to_string()));
        }
        if let Some(ref token) = self.verification_token {
            out.push((fields::TOKEN, token.clone()));
        }
        if let Some(verified_at) = self.verified_at {
            out.push((fields::VERIFIED_AT, verified_at.timestamp_millis().to_string()));
        }
        if let Some(ref public_key) = self.public_key {
            out.push((fields::PUBLIC_KEY, public_key.clone()));
        }
        if let Some(ref secret_key) = self.secret_key {
            out.push((fields::SECRET_KEY, secret_key.clone()));
        }

        out
    }

    /// Rebuild an account from its stored field map
    pub fn from_fields(mut map: HashMap<String, String>) -> PtuResult<Self> {
        let email = take_required(&mut map, fields::EMAIL)?;
        let password = take_required(&mut map, fields::PASSWORD)?;
        let env = take_required(&mut map, fields::ENV)?.parse()?;
        let created_at = parse_millis(&take_required(&mut map, fields::CREATED_AT)?)?;
        let expires_at = parse_millis(&take_required(&mut map, fields::EXPIRES_AT)?)?;

        let verification_context = match map.remove(fields::CONTEXT) {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                PtuError::Internal(format!("Corrupt verification context for {}: {}", email, e))
            })?),
            None => None,
        };
        let verified_at = match map.remove(fields::VERIFIED_AT) {
            Some(raw) => Some(parse_millis(&raw)?),
            None => None,
        };

        Ok(Account {
            do_verify: map.remove(fields::DO_VERIFY).as_deref() == Some("yes"),
            verification_token: map.remove(fields::TOKEN),
            public_key: map.remove(fields::PUBLIC_KEY),
            secret_key: map.remove(fields::SECRET_KEY),
            email,
            password,
            env,
            created_at,
            expires_at,
            verification_context,
            verified_at,
        })
    }

    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

/// Current time truncated to the millisecond precision records are stored at
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

fn take_required(map: &mut HashMap<String, String>, name: &str) -> PtuResult<String> {
    map.remove(name)
        .ok_or_else(|| PtuError::Internal(format!("Account record missing field '{}'", name)))
}

fn parse_millis(raw: &str) -> PtuResult<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| PtuError::Internal(format!("Invalid timestamp in account record: {}", raw)))
}

/// Account handed back by `getUnverifiedAccount`; carries the token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnverifiedAccount {
    pub email: String,
    pub password: String,
    pub token: String,
    /// Milliseconds since the epoch
    pub expires_at: i64,
    pub env: ServerEnv,
}

impl UnverifiedAccount {
    pub fn from_account(account: &Account) -> PtuResult<Self> {
        let token = account
            .verification_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PtuError::Registration(format!("No verification token issued for {}", account.email))
            })?;

        Ok(Self {
            email: account.email.clone(),
            password: account.password.clone(),
            token,
            expires_at: account.expires_at.timestamp_millis(),
            env: account.env,
        })
    }
}

/// Account handed back by `getVerifiedAccount`; never carries the token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedAccount {
    pub email: String,
    pub password: String,
    /// Milliseconds since the epoch
    pub expires_at: i64,
    pub env: ServerEnv,
}

impl From<&Account> for VerifiedAccount {
    fn from(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            password: account.password.clone(),
            expires_at: account.expires_at.timestamp_millis(),
            env: account.env,
        }
    }
}

/// Password check used by cancellation and assertion requests
///
/// Swap the implementation to tighten authentication without touching callers.
pub trait CredentialCheck: Send + Sync {
    fn matches(&self, supplied: &str, stored: &str) -> bool;
}

/// Plain equality; adequate for disposable test credentials
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPasswordCheck;

impl CredentialCheck for PlainPasswordCheck {
    fn matches(&self, supplied: &str, stored: &str) -> bool {
        supplied == stored
    }
}

/// Cancellation request body; absent fields are empty
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAccountRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "pass")]
    pub password: String,
}
