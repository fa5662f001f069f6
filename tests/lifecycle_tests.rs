/// End-to-end lifecycle tests against the in-memory store and a scripted IdP
use async_trait::async_trait;
use persona_testuser::{
    account::fields,
    assertion::AssertionRequest,
    config::{ServerConfig, ServerEnv},
    context::AppContext,
    crypto::{self, PublicKey},
    error::{PtuError, PtuResult},
    idp::{IdpClient, IdpSession, RegistrationReceipt},
    store::{IndexKind, MemoryBackend, StoreBackend},
    verifier::VerificationListener,
    AvailabilityTable,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_test::{assert_err, assert_ok};

/// Which IdP step the double refuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    Nothing,
    Registration,
    Authentication,
    Certification,
}

/// IdP double that reports every staged email and counts calls
struct ScriptedIdp {
    issue_token: bool,
    refusal: Refusal,
    staged: mpsc::UnboundedSender<String>,
    /// When set, emails staged without a token are reported ready here
    mailer: OnceLock<Arc<AvailabilityTable>>,
    authentications: AtomicUsize,
    certified_keys: Mutex<Vec<PublicKey>>,
    cancellations: AtomicUsize,
}

impl ScriptedIdp {
    fn scripted(
        issue_token: bool,
        refusal: Refusal,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let idp = Arc::new(Self {
            issue_token,
            refusal,
            staged: tx,
            mailer: OnceLock::new(),
            authentications: AtomicUsize::new(0),
            certified_keys: Mutex::new(Vec::new()),
            cancellations: AtomicUsize::new(0),
        });
        (idp, rx)
    }

    fn new(issue_token: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::scripted(issue_token, Refusal::Nothing)
    }

    fn refusing(refusal: Refusal) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::scripted(true, refusal)
    }
}

#[async_trait]
impl IdpClient for ScriptedIdp {
    async fn create_user(
        &self,
        env: ServerEnv,
        email: &str,
        _password: &str,
    ) -> PtuResult<RegistrationReceipt> {
        let _ = self.staged.send(email.to_string());
        if self.refusal == Refusal::Registration {
            return Err(PtuError::Registration("stage_user refused".to_string()));
        }
        if !self.issue_token {
            if let Some(table) = self.mailer.get() {
                table.on_ready(email, Some(format!("mailed-token-for-{}", email)));
            }
        }

        Ok(RegistrationReceipt {
            context: json!({ "csrf": "csrf-1", "cookie": format!("session={}", email), "env": env.as_str() }),
            token: self.issue_token.then(|| format!("token-for-{}", email)),
        })
    }

    async fn authenticate_user(
        &self,
        _env: ServerEnv,
        email: &str,
        _password: &str,
    ) -> PtuResult<IdpSession> {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        if self.refusal == Refusal::Authentication {
            return Err(PtuError::Idp("authenticate_user: login rejected".to_string()));
        }
        Ok(IdpSession {
            csrf: "csrf-2".to_string(),
            cookie: format!("auth={}", email),
        })
    }

    async fn certify_key(
        &self,
        _env: ServerEnv,
        _session: &IdpSession,
        email: &str,
        public_key: &PublicKey,
    ) -> PtuResult<String> {
        self.certified_keys.lock().unwrap().push(public_key.clone());
        if self.refusal == Refusal::Certification {
            return Err(PtuError::Idp("cert_key: certificate signing failed".to_string()));
        }
        Ok(format!("cert-for-{}", email.replace('@', "-at-")))
    }

    async fn cancel_account(&self, _env: ServerEnv, context: &Value) -> PtuResult<Value> {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "success": true, "cookie": context["cookie"] }))
    }
}

/// Backend whose every call fails as an unreachable server would
struct UnreachableBackend;

fn refused<T>() -> PtuResult<T> {
    Err(PtuError::Store("connection refused".to_string()))
}

#[async_trait]
impl StoreBackend for UnreachableBackend {
    async fn next_sequence(&self) -> PtuResult<u64> {
        refused()
    }

    async fn stage(&self, _: &str, _: &[(&'static str, String)], _: i64) -> PtuResult<()> {
        refused()
    }

    async fn fields(&self, _: &str) -> PtuResult<HashMap<String, String>> {
        refused()
    }

    async fn set_fields(&self, _: &str, _: &[(&'static str, String)]) -> PtuResult<()> {
        refused()
    }

    async fn claim_fields(
        &self,
        _: &str,
        _: &[(&'static str, String)],
    ) -> PtuResult<HashMap<String, String>> {
        refused()
    }

    async fn promote(&self, _: &str, _: i64, _: i64) -> PtuResult<()> {
        refused()
    }

    async fn membership(&self, _: &str) -> PtuResult<Option<IndexKind>> {
        refused()
    }

    async fn expired(&self, _: IndexKind, _: i64) -> PtuResult<Vec<String>> {
        refused()
    }

    async fn retire(&self, _: &[String]) -> PtuResult<()> {
        refused()
    }

    async fn ping(&self) -> PtuResult<()> {
        refused()
    }
}

async fn issued_account(ctx: &AppContext) -> AssertionRequest {
    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    AssertionRequest {
        email: account.email,
        password: account.password,
        env: "dev".to_string(),
        audience: "https://rp.example.org".to_string(),
        duration: None,
    }
}

fn context_with(idp: Arc<ScriptedIdp>) -> AppContext {
    AppContext::with_components(ServerConfig::default(), Arc::new(MemoryBackend::new()), idp)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_unverified_account_returns_token_without_waiting() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);
    let started = Instant::now();

    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(account.env, ServerEnv::Dev);
    assert_eq!(account.token, format!("token-for-{}", account.email));
    assert!(account.email.ends_with("@personatestuser.org"));
    assert_eq!(account.password.len(), 16);

    let view = serde_json::to_value(&account).unwrap();
    assert_eq!(view["env"], "dev");
    assert!(view["expiresAt"].is_i64());

    assert_eq!(
        ctx.store.membership(&account.email).await.unwrap(),
        Some(IndexKind::Staging)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unverified_account_without_token_fails() {
    let (idp, mut staged) = ScriptedIdp::new(false);
    let ctx = context_with(idp);

    // No token from registration and none reported by the verifier
    match ctx.account_manager.get_unverified_account(ServerEnv::Dev).await {
        Err(PtuError::Registration(_)) => {}
        other => panic!("Expected Registration error, got {:?}", other.map(|a| a.email)),
    }
    assert!(staged.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_verified_account_after_ready_event() {
    let (idp, mut staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);

    let availability = ctx.availability.clone();
    tokio::spawn(async move {
        if let Some(email) = staged.recv().await {
            sleep(Duration::from_millis(200)).await;
            availability.on_ready(&email, Some("final-token".to_string()));
        }
    });

    let started = Instant::now();
    let account = ctx
        .account_manager
        .get_verified_account(ServerEnv::Stage)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // First poll at or after 200ms lands at 350ms on the 50ms doubling schedule
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed <= Duration::from_millis(350));

    let view = serde_json::to_value(&account).unwrap();
    assert!(view.get("token").is_none());
    assert_eq!(view["env"], "stage");

    let stored = ctx.store.get(&account.email).await.unwrap();
    assert!(stored.is_verified());
    assert!(stored.verification_token.is_none());
    assert_eq!(
        ctx.store.membership(&account.email).await.unwrap(),
        Some(IndexKind::Valid)
    );
}

#[tokio::test(start_paused = true)]
async fn test_verified_account_times_out_at_deadline() {
    let (idp, mut staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);

    let started = Instant::now();
    let result = ctx
        .account_manager
        .get_verified_account(ServerEnv::Dev)
        .await;
    let elapsed = started.elapsed();

    let email = staged.recv().await.unwrap();
    match result {
        Err(PtuError::Timeout { email: timed_out }) => assert_eq!(timed_out, email),
        _ => panic!("Expected Timeout error"),
    }
    assert_eq!(elapsed, Duration::from_millis(5_000));

    // Left pending for a late verification or the sweep
    assert_eq!(
        ctx.store.membership(&email).await.unwrap(),
        Some(IndexKind::Staging)
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ready_events_are_harmless() {
    let (idp, mut staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);

    let availability = ctx.availability.clone();
    tokio::spawn(async move {
        if let Some(email) = staged.recv().await {
            availability.on_ready(&email, Some("first".to_string()));
            availability.on_ready(&email, Some("second".to_string()));
        }
    });

    let account = ctx
        .account_manager
        .get_verified_account(ServerEnv::Dev)
        .await
        .unwrap();
    let before = ctx.store.get(&account.email).await.unwrap();

    ctx.availability.on_ready(&account.email, Some("late".to_string()));

    assert_eq!(ctx.availability.len(), 1);
    assert_eq!(
        ctx.availability.get(&account.email).unwrap().token.as_deref(),
        Some("first")
    );
    assert_eq!(ctx.store.get(&account.email).await.unwrap(), before);
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_accounts() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let manager = ctx.account_manager.clone();
            let env = ServerEnv::ALL[i % ServerEnv::ALL.len()];
            tokio::spawn(async move { manager.get_unverified_account(env).await.unwrap() })
        })
        .collect();

    let mut emails = HashSet::new();
    let mut tokens = HashSet::new();
    for handle in handles {
        let account = handle.await.unwrap();
        assert_eq!(account.token, format!("token-for-{}", account.email));
        assert!(emails.insert(account.email));
        assert!(tokens.insert(account.token));
    }
    assert_eq!(emails.len(), 20);
}

#[tokio::test]
async fn test_registration_failure_leaves_account_staged() {
    let (idp, mut staged) = ScriptedIdp::refusing(Refusal::Registration);
    let ctx = context_with(idp);

    match ctx.account_manager.get_unverified_account(ServerEnv::Prod).await {
        Err(PtuError::Registration(msg)) => assert!(msg.contains("refused")),
        _ => panic!("Expected Registration error"),
    }

    let email = staged.recv().await.unwrap();
    assert_eq!(
        ctx.store.membership(&email).await.unwrap(),
        Some(IndexKind::Staging)
    );
}

#[tokio::test]
async fn test_unconfigured_environment_allocates_nothing() {
    let (idp, mut staged) = ScriptedIdp::new(true);
    let mut config = ServerConfig::default();
    config.environments.remove(&ServerEnv::Prod);
    let ctx = AppContext::with_components(config, Arc::new(MemoryBackend::new()), idp).unwrap();

    match ctx.account_manager.get_verified_account(ServerEnv::Prod).await {
        Err(PtuError::MissingParameter(_)) => {}
        _ => panic!("Expected MissingParameter error"),
    }
    assert!(staged.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_with_wrong_password_skips_idp() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp.clone());
    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    match ctx
        .account_manager
        .cancel_account(&account.email, "not-the-password")
        .await
    {
        Err(PtuError::AuthMismatch) => {}
        _ => panic!("Expected AuthMismatch error"),
    }
    match ctx
        .account_manager
        .cancel_account("ghost9@personatestuser.org", "whatever")
        .await
    {
        Err(PtuError::AuthMismatch) => {}
        _ => panic!("Expected AuthMismatch error"),
    }
    assert_eq!(idp.cancellations.load(Ordering::SeqCst), 0);

    let result = ctx
        .account_manager
        .cancel_account(&account.email, &account.password)
        .await
        .unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["cookie"], format!("session={}", account.email));
    assert_eq!(idp.cancellations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_assertion_missing_audience_has_no_side_effects() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp.clone());
    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    let request = AssertionRequest {
        email: account.email.clone(),
        password: account.password.clone(),
        env: "dev".to_string(),
        audience: String::new(),
        duration: None,
    };

    match ctx.assertion_issuer.issue(&request).await {
        Err(PtuError::MissingParameter(name)) => assert_eq!(name, "audience"),
        _ => panic!("Expected MissingParameter error"),
    }

    let stored = ctx.store.get(&account.email).await.unwrap();
    assert!(stored.public_key.is_none());
    assert!(stored.secret_key.is_none());
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_assertion_with_wrong_password() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp.clone());
    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    let request = AssertionRequest {
        email: account.email.clone(),
        password: "wrong".to_string(),
        env: "dev".to_string(),
        audience: "https://rp.example.org".to_string(),
        duration: None,
    };

    match ctx.assertion_issuer.issue(&request).await {
        Err(PtuError::CredentialMismatch) => {}
        _ => panic!("Expected CredentialMismatch error"),
    }
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 0);

    let unknown_env = AssertionRequest {
        env: "moon".to_string(),
        ..request
    };
    assert_err!(ctx.assertion_issuer.issue(&unknown_env).await);
}

#[tokio::test]
async fn test_assertion_bundle_is_signed_by_stored_key() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp.clone());
    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    let request = AssertionRequest {
        email: account.email.clone(),
        password: account.password.clone(),
        env: "dev".to_string(),
        audience: "https://rp.example.org".to_string(),
        duration: Some(120_000),
    };

    let issued = ctx.assertion_issuer.issue(&request).await.unwrap();
    let (certs, assertion) = crypto::split_bundle(&issued.bundle).unwrap();
    assert_eq!(certs.len(), 1);
    assert!(certs[0].starts_with("cert-for-"));

    let stored = ctx.store.get(&account.email).await.unwrap();
    let public = PublicKey::parse(stored.public_key.as_deref().unwrap()).unwrap();
    assert!(stored.secret_key.is_some());
    assert_eq!(idp.certified_keys.lock().unwrap()[0], public);

    let payload = crypto::verify_assertion(&assertion, &public).unwrap();
    assert_eq!(payload["aud"], "https://rp.example.org");
    assert_eq!(payload["exp"], issued.expires_at);

    // Second issuance reuses the stored keypair
    ctx.assertion_issuer.issue(&request).await.unwrap();
    let again = ctx.store.get(&account.email).await.unwrap();
    assert_eq!(again.public_key, stored.public_key);
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_keypair_fields_use_record_names() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp);
    let account = assert_ok!(ctx.store.allocate(ServerEnv::Dev, false).await);

    assert_ok!(
        ctx.store
            .set_field(&account.email, fields::PUBLIC_KEY, "{}".to_string())
            .await
    );

    let stored = assert_ok!(ctx.store.get(&account.email).await);
    assert_eq!(stored.public_key.as_deref(), Some("{}"));
    assert!(stored.secret_key.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unverified_account_takes_token_reported_by_verifier() {
    let (idp, _staged) = ScriptedIdp::new(false);
    let ctx = context_with(idp.clone());
    assert!(idp.mailer.set(ctx.availability.clone()).is_ok());

    let account = ctx
        .account_manager
        .get_unverified_account(ServerEnv::Dev)
        .await
        .unwrap();

    assert_eq!(account.token, format!("mailed-token-for-{}", account.email));
    let stored = ctx.store.get(&account.email).await.unwrap();
    assert_eq!(stored.verification_token.as_deref(), Some(account.token.as_str()));
}

#[tokio::test]
async fn test_store_failure_reaches_caller_verbatim() {
    let (idp, mut staged) = ScriptedIdp::new(true);
    let ctx = AppContext::with_components(
        ServerConfig::default(),
        Arc::new(UnreachableBackend),
        idp.clone(),
    )
    .unwrap();

    match ctx.account_manager.get_unverified_account(ServerEnv::Dev).await {
        Err(PtuError::Store(msg)) => assert_eq!(msg, "connection refused"),
        _ => panic!("Expected Store error"),
    }
    match ctx.account_manager.cancel_account("abel1@personatestuser.org", "p").await {
        Err(PtuError::Store(msg)) => assert_eq!(msg, "connection refused"),
        _ => panic!("Expected Store error"),
    }

    let request = AssertionRequest {
        email: "abel1@personatestuser.org".to_string(),
        password: "p".to_string(),
        env: "dev".to_string(),
        audience: "https://rp.example.org".to_string(),
        duration: None,
    };
    match ctx.assertion_issuer.issue(&request).await {
        Err(PtuError::Store(msg)) => assert_eq!(msg, "connection refused"),
        _ => panic!("Expected Store error"),
    }

    // Nothing reached the IdP
    assert!(staged.try_recv().is_err());
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_authentication_failure_is_surfaced_once() {
    let (idp, _staged) = ScriptedIdp::refusing(Refusal::Authentication);
    let ctx = context_with(idp.clone());
    let request = issued_account(&ctx).await;

    match ctx.assertion_issuer.issue(&request).await {
        Err(PtuError::Idp(msg)) => assert_eq!(msg, "authenticate_user: login rejected"),
        _ => panic!("Expected Idp error"),
    }
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 1);
    assert!(idp.certified_keys.lock().unwrap().is_empty());

    // The keypair was stored before the IdP was asked
    let stored = ctx.store.get(&request.email).await.unwrap();
    assert!(stored.public_key.is_some());
    assert!(stored.secret_key.is_some());
}

#[tokio::test]
async fn test_certification_failure_is_surfaced_once() {
    let (idp, _staged) = ScriptedIdp::refusing(Refusal::Certification);
    let ctx = context_with(idp.clone());
    let request = issued_account(&ctx).await;

    match ctx.assertion_issuer.issue(&request).await {
        Err(PtuError::Idp(msg)) => assert_eq!(msg, "cert_key: certificate signing failed"),
        _ => panic!("Expected Idp error"),
    }
    assert_eq!(idp.authentications.load(Ordering::SeqCst), 1);
    assert_eq!(idp.certified_keys.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assertions_share_one_keypair() {
    let (idp, _staged) = ScriptedIdp::new(true);
    let ctx = context_with(idp.clone());

    for _ in 0..20 {
        let request = issued_account(&ctx).await;
        let first_cert = idp.certified_keys.lock().unwrap().len();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let issuer = ctx.assertion_issuer.clone();
                let request = request.clone();
                tokio::spawn(async move { issuer.issue(&request).await.unwrap() })
            })
            .collect();

        let mut bundles = Vec::new();
        for handle in handles {
            bundles.push(handle.await.unwrap());
        }

        let stored = ctx.store.get(&request.email).await.unwrap();
        let public = PublicKey::parse(stored.public_key.as_deref().unwrap()).unwrap();

        let certified = idp.certified_keys.lock().unwrap()[first_cert..].to_vec();
        assert_eq!(certified.len(), 16);
        assert!(certified.iter().all(|key| *key == public));

        for issued in bundles {
            let (_, assertion) = crypto::split_bundle(&issued.bundle).unwrap();
            assert_ok!(crypto::verify_assertion(&assertion, &public));
        }
    }
}
