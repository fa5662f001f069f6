/// Configuration management for the test user service
use crate::error::{PtuError, PtuResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;

/// Default domain for generated emails when no public URL is configured
pub const DEFAULT_EMAIL_DOMAIN: &str = "personatestuser.org";

/// IdP deployment an account belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerEnv {
    Prod,
    Stage,
    Dev,
}

impl ServerEnv {
    pub const ALL: [ServerEnv; 3] = [ServerEnv::Prod, ServerEnv::Stage, ServerEnv::Dev];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerEnv::Prod => "prod",
            ServerEnv::Stage => "stage",
            ServerEnv::Dev => "dev",
        }
    }
}

impl fmt::Display for ServerEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerEnv {
    type Err = PtuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prod" | "production" => Ok(ServerEnv::Prod),
            "stage" | "staging" => Ok(ServerEnv::Stage),
            "dev" | "development" => Ok(ServerEnv::Dev),
            _ => Err(PtuError::MissingParameter(format!("unknown env '{}'", s))),
        }
    }
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub verification: VerificationConfig,
    pub accounts: AccountConfig,
    pub assertion: AssertionConfig,
    pub environments: BTreeMap<ServerEnv, EnvironmentConfig>,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Domain part of every generated email
    pub email_domain: String,
}

/// Account store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackendConfig,
    /// Prefix for every key the service writes (default: "ptu:")
    pub key_prefix: String,
}

/// Store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreBackendConfig {
    Redis { url: String },
    Memory,
}

/// Verification wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// First poll interval in milliseconds; doubles after every poll
    pub initial_interval_ms: u64,
    /// Total wait budget in milliseconds
    pub deadline_ms: u64,
}

/// Longest account lifetime accepted, one year
pub const MAX_ACCOUNT_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Longest default assertion lifetime accepted, one year
pub const MAX_ASSERTION_DURATION_MS: u64 = MAX_ACCOUNT_TTL_SECS * 1000;

/// Account allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Staging lifetime in seconds
    pub ttl_secs: u64,
    pub password_length: usize,
    /// Expiry sweep period in seconds
    pub sweep_interval_secs: u64,
}

/// Assertion signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionConfig {
    pub algorithm: String,
    pub keysize: u32,
    /// Assertion lifetime when the caller gives none, in milliseconds
    pub default_duration_ms: u64,
}

/// Per-environment collaborator endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Base URL of the IdP wsapi
    pub idp_url: String,
    /// WebSocket URL of the verification notifier, if one runs for this env
    pub verifier_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit JSON log lines instead of the human-readable format
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        for env in ServerEnv::ALL {
            environments.insert(
                env,
                EnvironmentConfig {
                    idp_url: default_idp_url(env).to_string(),
                    verifier_url: None,
                },
            );
        }

        Self {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 3000,
                email_domain: DEFAULT_EMAIL_DOMAIN.to_string(),
            },
            store: StoreConfig {
                backend: StoreBackendConfig::Memory,
                key_prefix: "ptu:".to_string(),
            },
            verification: VerificationConfig {
                initial_interval_ms: 50,
                deadline_ms: 5000,
            },
            accounts: AccountConfig {
                ttl_secs: 3600,
                password_length: 16,
                sweep_interval_secs: 300,
            },
            assertion: AssertionConfig {
                algorithm: "ES256K".to_string(),
                keysize: 256,
                default_duration_ms: 60 * 60 * 1000,
            },
            environments,
            logging: LoggingConfig {
                level: "persona_testuser=debug,tower_http=debug".to_string(),
                json: false,
            },
        }
    }
}

fn default_idp_url(env: ServerEnv) -> &'static str {
    match env {
        ServerEnv::Prod => "https://login.persona.org",
        ServerEnv::Stage => "https://login.anosrep.org",
        ServerEnv::Dev => "https://login.dev.anosrep.org",
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Hostname of a public URL, used as the email domain
pub fn domain_from_public_url(public_url: &str) -> Option<String> {
    reqwest::Url::parse(public_url)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_string()))
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> PtuResult<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let hostname = env::var("PTU_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = env::var("PTU_PORT")
            .unwrap_or_else(|_| defaults.service.port.to_string())
            .parse()
            .map_err(|_| PtuError::Validation("Invalid port number".to_string()))?;

        let email_domain = match env::var("PUBLIC_URL") {
            Ok(public_url) => domain_from_public_url(&public_url).ok_or_else(|| {
                PtuError::Validation(format!("PUBLIC_URL has no hostname: {}", public_url))
            })?,
            Err(_) => env::var("PTU_EMAIL_DOMAIN").unwrap_or(defaults.service.email_domain),
        };

        let backend = match env::var("PTU_STORE")
            .unwrap_or_else(|_| "redis".to_string())
            .as_str()
        {
            "memory" => StoreBackendConfig::Memory,
            "redis" => StoreBackendConfig::Redis {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            other => {
                return Err(PtuError::Validation(format!(
                    "Unknown store backend: {}",
                    other
                )))
            }
        };
        let key_prefix = env::var("PTU_KEY_PREFIX").unwrap_or(defaults.store.key_prefix);

        // Environments are enabled by their IdP URL; a deployment that sets none gets all defaults
        let mut environments = BTreeMap::new();
        for server_env in ServerEnv::ALL {
            let suffix = server_env.as_str().to_uppercase();
            if let Ok(idp_url) = env::var(format!("PTU_IDP_URL_{}", suffix)) {
                environments.insert(
                    server_env,
                    EnvironmentConfig {
                        idp_url,
                        verifier_url: env::var(format!("PTU_VERIFIER_URL_{}", suffix)).ok(),
                    },
                );
            }
        }
        if environments.is_empty() {
            environments = defaults.environments;
            for (server_env, env_config) in environments.iter_mut() {
                let suffix = server_env.as_str().to_uppercase();
                env_config.verifier_url = env::var(format!("PTU_VERIFIER_URL_{}", suffix)).ok();
            }
        }

        let config = ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                email_domain,
            },
            store: StoreConfig {
                backend,
                key_prefix,
            },
            verification: VerificationConfig {
                initial_interval_ms: parse_var(
                    "PTU_VERIFY_INITIAL_INTERVAL_MS",
                    defaults.verification.initial_interval_ms,
                ),
                deadline_ms: parse_var("PTU_VERIFY_DEADLINE_MS", defaults.verification.deadline_ms),
            },
            accounts: AccountConfig {
                ttl_secs: parse_var("PTU_ACCOUNT_TTL_SECS", defaults.accounts.ttl_secs),
                password_length: parse_var(
                    "PTU_PASSWORD_LENGTH",
                    defaults.accounts.password_length,
                ),
                sweep_interval_secs: parse_var(
                    "PTU_SWEEP_INTERVAL_SECS",
                    defaults.accounts.sweep_interval_secs,
                ),
            },
            assertion: AssertionConfig {
                algorithm: env::var("PTU_ASSERTION_ALGORITHM")
                    .unwrap_or(defaults.assertion.algorithm),
                keysize: parse_var("PTU_ASSERTION_KEYSIZE", defaults.assertion.keysize),
                default_duration_ms: parse_var(
                    "PTU_ASSERTION_DURATION_MS",
                    defaults.assertion.default_duration_ms,
                ),
            },
            environments,
            logging: LoggingConfig {
                level: env::var("RUST_LOG").unwrap_or(defaults.logging.level),
                json: parse_var("PTU_LOG_JSON", defaults.logging.json),
            },
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> PtuResult<()> {
        if self.service.email_domain.is_empty() {
            return Err(PtuError::Validation("Email domain cannot be empty".to_string()));
        }

        if self.verification.initial_interval_ms == 0 {
            return Err(PtuError::Validation(
                "Verification poll interval must be positive".to_string(),
            ));
        }

        if self.accounts.password_length == 0 {
            return Err(PtuError::Validation(
                "Password length must be positive".to_string(),
            ));
        }

        if self.accounts.ttl_secs > MAX_ACCOUNT_TTL_SECS {
            return Err(PtuError::Validation(format!(
                "Account TTL of {}s exceeds the maximum of {}s",
                self.accounts.ttl_secs, MAX_ACCOUNT_TTL_SECS
            )));
        }

        if self.assertion.default_duration_ms > MAX_ASSERTION_DURATION_MS {
            return Err(PtuError::Validation(format!(
                "Assertion duration of {}ms exceeds the maximum of {}ms",
                self.assertion.default_duration_ms, MAX_ASSERTION_DURATION_MS
            )));
        }

        if self.environments.is_empty() {
            return Err(PtuError::Validation(
                "At least one IdP environment must be configured".to_string(),
            ));
        }

        // Rejects algorithm/keysize pairs the signer cannot produce
        crate::crypto::KeyAlgorithm::from_config(&self.assertion.algorithm, self.assertion.keysize)?;

        Ok(())
    }

    /// Endpoints for an environment, or MissingParameter when it is not configured
    pub fn environment(&self, env: ServerEnv) -> PtuResult<&EnvironmentConfig> {
        self.environments
            .get(&env)
            .ok_or_else(|| PtuError::MissingParameter(format!("env '{}' is not configured", env)))
    }
}
