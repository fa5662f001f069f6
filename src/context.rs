/// Application context and dependency injection
use crate::{
    account::{AccountManager, CredentialCheck, PlainPasswordCheck},
    assertion::AssertionIssuer,
    availability::AvailabilityTable,
    config::{ServerConfig, StoreBackendConfig},
    crypto::KeyAlgorithm,
    error::PtuResult,
    idp::{HttpIdpClient, IdpClient},
    names::NameGenerator,
    store::{AccountStore, MemoryBackend, RedisBackend, StoreBackend},
    verifier::{VerificationListener, VerifierEndpoint, WebSocketNotifier},
    waiter::BoundedWaiter,
};
use std::sync::Arc;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub store: AccountStore,
    pub availability: Arc<AvailabilityTable>,
    pub account_manager: Arc<AccountManager>,
    pub assertion_issuer: Arc<AssertionIssuer>,
    pub notifier: Arc<WebSocketNotifier>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> PtuResult<Self> {
        config.validate()?;

        let backend: Arc<dyn StoreBackend> = match &config.store.backend {
            StoreBackendConfig::Redis { url } => {
                Arc::new(RedisBackend::connect(url, &config.store.key_prefix).await?)
            }
            StoreBackendConfig::Memory => {
                info!("Using in-memory account store; accounts will not survive a restart");
                Arc::new(MemoryBackend::new())
            }
        };

        let idp: Arc<dyn IdpClient> = Arc::new(HttpIdpClient::new(&config)?);

        Self::with_components(config, backend, idp)
    }

    /// Wire the services around an existing store backend and IdP client
    pub fn with_components(
        config: ServerConfig,
        backend: Arc<dyn StoreBackend>,
        idp: Arc<dyn IdpClient>,
    ) -> PtuResult<Self> {
        config.validate()?;

        let names = NameGenerator::new(
            config.service.email_domain.clone(),
            config.accounts.password_length,
        );
        let store = AccountStore::new(
            backend,
            names,
            chrono::Duration::seconds(config.accounts.ttl_secs as i64),
        );

        let availability = Arc::new(AvailabilityTable::new());
        let credentials: Arc<dyn CredentialCheck> = Arc::new(PlainPasswordCheck);
        let environments: Vec<_> = config.environments.keys().copied().collect();

        let account_manager = Arc::new(AccountManager::new(
            store.clone(),
            Arc::clone(&idp),
            Arc::clone(&availability),
            BoundedWaiter::from_millis(
                config.verification.initial_interval_ms,
                config.verification.deadline_ms,
            ),
            Arc::clone(&credentials),
            environments.clone(),
        ));

        let assertion_issuer = Arc::new(AssertionIssuer::new(
            store.clone(),
            idp,
            credentials,
            KeyAlgorithm::from_config(&config.assertion.algorithm, config.assertion.keysize)?,
            chrono::Duration::milliseconds(config.assertion.default_duration_ms as i64),
            environments,
        ));

        let endpoints = config
            .environments
            .iter()
            .filter_map(|(env, cfg)| {
                cfg.verifier_url.clone().map(|url| VerifierEndpoint { env: *env, url })
            })
            .collect();
        let listener: Arc<dyn VerificationListener> = availability.clone();
        let notifier = Arc::new(WebSocketNotifier::new(endpoints, listener));

        Ok(Self {
            config: Arc::new(config),
            store,
            availability,
            account_manager,
            assertion_issuer,
            notifier,
        })
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
