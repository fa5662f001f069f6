/// Assertion issuance for test accounts
///
/// Turns an account's credentials into a certificate-plus-assertion bundle
/// a relying party can verify against the account's IdP.

use crate::{
    account::{fields, Account, CredentialCheck},
    config::ServerEnv,
    crypto::{self, KeyAlgorithm, KeyPair},
    error::{PtuError, PtuResult},
    idp::IdpClient,
    metrics,
    store::AccountStore,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Assertion request as supplied by callers; absent fields are empty
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssertionRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "pass")]
    pub password: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub audience: String,
    /// Validity in milliseconds; absent or zero means the configured default
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Issued bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionBundle {
    pub email: String,
    pub audience: String,
    /// Milliseconds since the epoch
    pub expires_at: i64,
    pub bundle: String,
}

fn require<'a>(value: &'a str, name: &str) -> PtuResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PtuError::MissingParameter(name.to_string()));
    }
    Ok(value)
}

pub struct AssertionIssuer {
    store: AccountStore,
    idp: Arc<dyn IdpClient>,
    credentials: Arc<dyn CredentialCheck>,
    algorithm: KeyAlgorithm,
    default_duration: Duration,
    environments: BTreeSet<ServerEnv>,
}

impl AssertionIssuer {
    pub fn new(
        store: AccountStore,
        idp: Arc<dyn IdpClient>,
        credentials: Arc<dyn CredentialCheck>,
        algorithm: KeyAlgorithm,
        default_duration: Duration,
        environments: impl IntoIterator<Item = ServerEnv>,
    ) -> Self {
        Self {
            store,
            idp,
            credentials,
            algorithm,
            default_duration,
            environments: environments.into_iter().collect(),
        }
    }

    /// Issue a bundle for the account named in `request`
    pub async fn issue(&self, request: &AssertionRequest) -> PtuResult<AssertionBundle> {
        let result = self.issue_inner(request).await;
        metrics::record_assertion(result.is_ok());
        result
    }

    async fn issue_inner(&self, request: &AssertionRequest) -> PtuResult<AssertionBundle> {
        let email = require(&request.email, "email")?;
        let password = require(&request.password, "password")?;
        let audience = require(&request.audience, "audience")?;
        let env: ServerEnv = require(&request.env, "env")?.parse()?;
        if !self.environments.contains(&env) {
            return Err(PtuError::MissingParameter(format!(
                "env '{}' is not configured",
                env
            )));
        }

        let duration = match request.duration {
            Some(ms) if ms > 0 => Duration::milliseconds(i64::try_from(ms).map_err(|_| {
                PtuError::Validation("duration is out of range".to_string())
            })?),
            _ => self.default_duration,
        };
        let expires_at = Utc::now()
            .checked_add_signed(duration)
            .ok_or_else(|| PtuError::Validation("duration is out of range".to_string()))?;

        let account = match self.store.find(email).await? {
            Some(account) if self.credentials.matches(password, &account.password) => account,
            _ => {
                warn!(email, "Assertion requested with mismatched credentials");
                return Err(PtuError::CredentialMismatch);
            }
        };

        let keys = self.keypair_for(&account).await?;

        let session = self.idp.authenticate_user(env, email, password).await?;
        let cert = self
            .idp
            .certify_key(env, &session, email, &keys.public_key())
            .await?;
        let assertion = crypto::sign_assertion(&keys, Default::default(), audience, expires_at)?;

        info!(email, audience, env = %env, "Issued assertion");

        Ok(AssertionBundle {
            email: email.to_string(),
            audience: audience.to_string(),
            expires_at: expires_at.timestamp_millis(),
            bundle: crypto::bundle(&[cert], &assertion),
        })
    }

    /// Reuse the account's stored keypair, or generate one and store it
    /// unless a concurrent request stored its own first
    async fn keypair_for(&self, account: &Account) -> PtuResult<KeyPair> {
        if let (Some(public), Some(secret)) = (&account.public_key, &account.secret_key) {
            debug!(email = %account.email, "Reusing stored keypair");
            return self.checked(KeyPair::from_stored(public, secret)?);
        }

        let fresh = KeyPair::generate(self.algorithm)?;
        let stored = self
            .store
            .claim_fields(
                &account.email,
                &[
                    (fields::PUBLIC_KEY, fresh.public_key().serialize()?),
                    (fields::SECRET_KEY, fresh.secret_key().serialize()?),
                ],
            )
            .await?;

        match (stored.get(fields::PUBLIC_KEY), stored.get(fields::SECRET_KEY)) {
            (Some(public), Some(secret)) => {
                let keys = self.checked(KeyPair::from_stored(public, secret)?)?;
                if keys.public_key() == fresh.public_key() {
                    debug!(email = %account.email, "Generated and stored keypair");
                } else {
                    debug!(email = %account.email, "Adopted keypair stored by a concurrent request");
                }
                Ok(keys)
            }
            _ => Err(PtuError::Store(format!(
                "keypair for {} missing after write",
                account.email
            ))),
        }
    }

    /// Stored keypairs are never replaced, so one of another algorithm is an error
    fn checked(&self, keys: KeyPair) -> PtuResult<KeyPair> {
        if keys.algorithm() != self.algorithm {
            warn!(algorithm = keys.algorithm().jws_name(), "Stored keypair uses another algorithm");
            return Err(PtuError::Signing(format!(
                "stored keypair uses {} but {} is configured",
                keys.algorithm().jws_name(),
                self.algorithm.jws_name()
            )));
        }
        Ok(keys)
    }
}
