/// Identity provider collaborator
///
/// Creates, authenticates, certifies and cancels remote accounts on the IdP
/// of a given environment. Failures are returned unmodified; nothing here
/// retries.

use crate::config::{ServerConfig, ServerEnv};
use crate::crypto::PublicKey;
use crate::error::{PtuError, PtuResult};
use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of creating a remote account
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationReceipt {
    /// Opaque state needed later to cancel the remote account
    pub context: Value,
    /// Verification token, when the IdP hands one back at staging time
    pub token: Option<String>,
}

/// Authenticated IdP session for one account
#[derive(Debug, Clone, PartialEq)]
pub struct IdpSession {
    pub csrf: String,
    pub cookie: String,
}

#[async_trait]
pub trait IdpClient: Send + Sync {
    /// Stage a new remote account; failures are `Registration` errors
    async fn create_user(
        &self,
        env: ServerEnv,
        email: &str,
        password: &str,
    ) -> PtuResult<RegistrationReceipt>;

    async fn authenticate_user(
        &self,
        env: ServerEnv,
        email: &str,
        password: &str,
    ) -> PtuResult<IdpSession>;

    /// Ask the IdP to certify `public_key` for `email`; returns the certificate
    async fn certify_key(
        &self,
        env: ServerEnv,
        session: &IdpSession,
        email: &str,
        public_key: &PublicKey,
    ) -> PtuResult<String>;

    async fn cancel_account(&self, env: ServerEnv, context: &Value) -> PtuResult<Value>;
}

/// Session state kept as the cancellation context
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WsapiContext {
    csrf: String,
    cookie: String,
}

#[derive(Debug, Deserialize)]
struct SessionContextResponse {
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    success: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Collect `name=value` pairs from Set-Cookie headers into a Cookie header
fn cookie_header(previous: Option<&str>, response: &Response) -> String {
    let mut jar: Vec<(String, String)> = previous
        .unwrap_or_default()
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for value in response.headers().get_all(header::SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        let pair = raw.split(';').next().unwrap_or_default().trim();
        if let Some((name, val)) = pair.split_once('=') {
            jar.retain(|(k, _)| k != name);
            jar.push((name.to_string(), val.to_string()));
        }
    }

    jar.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

/// HTTP client for BrowserID-style wsapi endpoints
pub struct HttpIdpClient {
    http: Client,
    endpoints: HashMap<ServerEnv, String>,
}

impl HttpIdpClient {
    pub fn new(config: &ServerConfig) -> PtuResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PtuError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let endpoints = config
            .environments
            .iter()
            .map(|(env, cfg)| (*env, cfg.idp_url.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self { http, endpoints })
    }

    fn url(&self, env: ServerEnv, method: &str) -> PtuResult<String> {
        let base = self
            .endpoints
            .get(&env)
            .ok_or_else(|| PtuError::MissingParameter(format!("env '{}' is not configured", env)))?;
        Ok(format!("{}/wsapi/{}", base, method))
    }

    /// Fetch a fresh CSRF token and session cookie
    async fn session_context(&self, env: ServerEnv) -> PtuResult<WsapiContext> {
        let response = self
            .http
            .get(self.url(env, "session_context")?)
            .send()
            .await
            .map_err(|e| PtuError::Idp(format!("session_context request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PtuError::Idp(format!(
                "session_context returned {}",
                response.status()
            )));
        }

        let cookie = cookie_header(None, &response);
        let body: SessionContextResponse = response
            .json()
            .await
            .map_err(|e| PtuError::Idp(format!("Invalid session_context response: {}", e)))?;

        Ok(WsapiContext {
            csrf: body.csrf_token,
            cookie,
        })
    }

    async fn post(
        &self,
        env: ServerEnv,
        method: &str,
        context: &WsapiContext,
        body: Value,
    ) -> PtuResult<Response> {
        let response = self
            .http
            .post(self.url(env, method)?)
            .header(header::COOKIE, &context.cookie)
            .json(&body)
            .send()
            .await
            .map_err(|e| PtuError::Idp(format!("{} request failed: {}", method, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PtuError::Idp(format!(
                "{} returned {}: {}",
                method, status, detail
            )));
        }

        Ok(response)
    }

    async fn expect_success(method: &str, response: Response) -> PtuResult<SuccessResponse> {
        let body: SuccessResponse = response
            .json()
            .await
            .map_err(|e| PtuError::Idp(format!("Invalid {} response: {}", method, e)))?;

        if !body.success {
            return Err(PtuError::Idp(format!(
                "{} refused: {}",
                method,
                body.reason.as_deref().unwrap_or("no reason given")
            )));
        }

        Ok(body)
    }
}

#[async_trait]
impl IdpClient for HttpIdpClient {
    async fn create_user(
        &self,
        env: ServerEnv,
        email: &str,
        password: &str,
    ) -> PtuResult<RegistrationReceipt> {
        let registration = async {
            let context = self.session_context(env).await?;
            let response = self
                .post(
                    env,
                    "stage_user",
                    &context,
                    json!({
                        "email": email,
                        "pass": password,
                        "site": format!("https://{}", email.rsplit('@').next().unwrap_or_default()),
                        "csrf": context.csrf,
                    }),
                )
                .await?;
            let cookie = cookie_header(Some(&context.cookie), &response);
            let body = Self::expect_success("stage_user", response).await?;

            let context = serde_json::to_value(WsapiContext {
                csrf: context.csrf,
                cookie,
            })
            .map_err(|e| PtuError::Internal(format!("Failed to encode IdP context: {}", e)))?;

            Ok::<_, PtuError>(RegistrationReceipt {
                context,
                token: body.token,
            })
        };

        match registration.await {
            Ok(receipt) => {
                info!(env = %env, email, "Staged remote account");
                Ok(receipt)
            }
            Err(PtuError::MissingParameter(msg)) => Err(PtuError::MissingParameter(msg)),
            Err(e) => {
                warn!(env = %env, email, "Remote account creation failed: {}", e);
                Err(PtuError::Registration(e.to_string()))
            }
        }
    }

    async fn authenticate_user(
        &self,
        env: ServerEnv,
        email: &str,
        password: &str,
    ) -> PtuResult<IdpSession> {
        let context = self.session_context(env).await?;
        let response = self
            .post(
                env,
                "authenticate_user",
                &context,
                json!({
                    "email": email,
                    "pass": password,
                    "ephemeral": false,
                    "csrf": context.csrf,
                }),
            )
            .await?;
        let cookie = cookie_header(Some(&context.cookie), &response);
        Self::expect_success("authenticate_user", response).await?;

        debug!(env = %env, email, "Authenticated with IdP");

        Ok(IdpSession {
            csrf: context.csrf,
            cookie,
        })
    }

    async fn certify_key(
        &self,
        env: ServerEnv,
        session: &IdpSession,
        email: &str,
        public_key: &PublicKey,
    ) -> PtuResult<String> {
        let context = WsapiContext {
            csrf: session.csrf.clone(),
            cookie: session.cookie.clone(),
        };
        let response = self
            .post(
                env,
                "cert_key",
                &context,
                json!({
                    "email": email,
                    "pubkey": public_key.serialize()?,
                    "ephemeral": false,
                    "csrf": session.csrf,
                }),
            )
            .await?;

        let cert = response
            .text()
            .await
            .map_err(|e| PtuError::Idp(format!("Failed to read certificate: {}", e)))?;

        if cert.trim().is_empty() {
            return Err(PtuError::Idp("IdP returned an empty certificate".to_string()));
        }

        Ok(cert.trim().to_string())
    }

    async fn cancel_account(&self, env: ServerEnv, context: &Value) -> PtuResult<Value> {
        let context: WsapiContext = serde_json::from_value(context.clone())
            .map_err(|e| PtuError::Idp(format!("Unusable cancellation context: {}", e)))?;

        let response = self
            .post(
                env,
                "account_cancel",
                &context,
                json!({ "csrf": context.csrf }),
            )
            .await?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| PtuError::Idp(format!("Invalid account_cancel response: {}", e)))?;

        info!(env = %env, "Cancelled remote account");
        Ok(result)
    }
}
