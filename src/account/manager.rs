/// Account lifecycle manager
///
/// Drives one requested account through
/// `Allocated -> Registered -> (Awaiting | Skipped) -> Ready | Failed | TimedOut`.
/// Each request tracks only its own email, so any number of requests may
/// be in flight at once.

use crate::{
    account::{Account, CredentialCheck, UnverifiedAccount, VerifiedAccount, fields},
    availability::AvailabilityTable,
    config::ServerEnv,
    error::{PtuError, PtuResult},
    idp::IdpClient,
    metrics,
    store::AccountStore,
    waiter::{BoundedWaiter, WaitOutcome},
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Where a requested account is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Allocated,
    Registered,
    Awaiting,
    Skipped,
    Ready,
    Failed,
    TimedOut,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Allocated => "allocated",
            LifecycleState::Registered => "registered",
            LifecycleState::Awaiting => "awaiting",
            LifecycleState::Skipped => "skipped",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
            LifecycleState::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Account manager service
pub struct AccountManager {
    store: AccountStore,
    idp: Arc<dyn IdpClient>,
    availability: Arc<AvailabilityTable>,
    waiter: BoundedWaiter,
    credentials: Arc<dyn CredentialCheck>,
    environments: BTreeSet<ServerEnv>,
}

impl AccountManager {
    pub fn new(
        store: AccountStore,
        idp: Arc<dyn IdpClient>,
        availability: Arc<AvailabilityTable>,
        waiter: BoundedWaiter,
        credentials: Arc<dyn CredentialCheck>,
        environments: impl IntoIterator<Item = ServerEnv>,
    ) -> Self {
        Self {
            store,
            idp,
            availability,
            waiter,
            credentials,
            environments: environments.into_iter().collect(),
        }
    }

    fn transition(state: LifecycleState) {
        debug!(state = %state, "Lifecycle transition");
    }

    fn lifecycle_span(operation: &'static str, env: ServerEnv) -> Span {
        info_span!(
            "lifecycle",
            operation,
            request_id = %Uuid::new_v4(),
            env = %env,
            email = tracing::field::Empty,
        )
    }

    /// Allocate and register an account; returns it with the IdP context
    /// and any registration token filled in
    async fn provision(&self, env: ServerEnv, do_verify: bool) -> PtuResult<Account> {
        if !self.environments.contains(&env) {
            return Err(PtuError::MissingParameter(format!(
                "env '{}' is not configured",
                env
            )));
        }

        let mut account = self.store.allocate(env, do_verify).await?;
        Span::current().record("email", account.email.as_str());
        metrics::record_account_allocated(env.as_str(), do_verify);
        Self::transition(LifecycleState::Allocated);

        let receipt = match self
            .idp
            .create_user(env, &account.email, &account.password)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                Self::transition(LifecycleState::Failed);
                warn!("Registration failed; account left for the expiry sweep: {}", e);
                return Err(match e {
                    PtuError::Registration(_) => e,
                    other => PtuError::Registration(other.to_string()),
                });
            }
        };

        let mut updates = vec![(fields::CONTEXT, receipt.context.to_string())];
        if let Some(ref token) = receipt.token {
            updates.push((fields::TOKEN, token.clone()));
        }
        self.store.set_fields(&account.email, &updates).await?;

        account.verification_context = Some(receipt.context);
        account.verification_token = receipt.token;
        Self::transition(LifecycleState::Registered);

        Ok(account)
    }

    /// Fresh account whose verification is left to the caller
    pub async fn get_unverified_account(&self, env: ServerEnv) -> PtuResult<UnverifiedAccount> {
        let span = Self::lifecycle_span("unverified", env);
        async {
            let mut account = self.provision(env, false).await?;

            if account.verification_token.is_none() {
                // Token already reported by the verifier; no waiting here
                if let Some(token) = self
                    .availability
                    .get(&account.email)
                    .and_then(|marker| marker.token)
                {
                    self.store
                        .set_field(&account.email, fields::TOKEN, token.clone())
                        .await?;
                    account.verification_token = Some(token);
                }
            }

            let view = UnverifiedAccount::from_account(&account)?;
            Self::transition(LifecycleState::Skipped);
            info!("Issued unverified account");
            Ok(view)
        }
        .instrument(span)
        .await
    }

    /// Fresh account, returned once the IdP reports it verified
    pub async fn get_verified_account(&self, env: ServerEnv) -> PtuResult<VerifiedAccount> {
        let span = Self::lifecycle_span("verified", env);
        async {
            let account = self.provision(env, true).await?;
            Self::transition(LifecycleState::Awaiting);

            let started = Instant::now();
            let outcome = self
                .waiter
                .wait_for(|| self.availability.is_ready(&account.email))
                .await;
            let waited = started.elapsed().as_secs_f64();

            match outcome {
                WaitOutcome::Ready => {
                    metrics::record_verification(env.as_str(), true, waited);
                    self.store.promote(&account).await?;
                    let current = self.store.get(&account.email).await?;
                    Self::transition(LifecycleState::Ready);
                    info!(waited, "Issued verified account");
                    Ok(VerifiedAccount::from(&current))
                }
                WaitOutcome::TimedOut => {
                    metrics::record_verification(env.as_str(), false, waited);
                    Self::transition(LifecycleState::TimedOut);
                    warn!(waited, "Verification did not complete in time");
                    Err(PtuError::Timeout {
                        email: account.email.clone(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Cancel the remote account after checking the caller's password
    ///
    /// The local record is left for the expiry sweep.
    pub async fn cancel_account(&self, email: &str, password: &str) -> PtuResult<serde_json::Value> {
        let account = match self.store.find(email).await? {
            Some(account) if self.credentials.matches(password, &account.password) => account,
            _ => {
                metrics::record_cancellation(false);
                warn!(email, "Cancellation refused: credentials do not match");
                return Err(PtuError::AuthMismatch);
            }
        };

        let context = account.verification_context.as_ref().ok_or_else(|| {
            metrics::record_cancellation(false);
            PtuError::Idp(format!("No IdP context stored for {}", email))
        })?;

        let result = self.idp.cancel_account(account.env, context).await;
        metrics::record_cancellation(result.is_ok());

        if result.is_ok() {
            info!(email, env = %account.env, "Cancelled account");
        }
        result
    }
}
