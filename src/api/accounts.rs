/// Account endpoints
///
/// Thin handlers over the lifecycle manager and the assertion issuer.
use crate::{
    account::{CancelAccountRequest, UnverifiedAccount, VerifiedAccount},
    assertion::{AssertionBundle, AssertionRequest},
    config::ServerEnv,
    context::AppContext,
    error::{PtuError, PtuResult},
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

/// Build account routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/email/:env", get(verified_email))
        .route("/unverified_email/:env", get(unverified_email))
        .route("/cancel", post(cancel))
        .route("/assertion", post(assertion))
}

/// GET /email/:env
async fn verified_email(
    State(ctx): State<AppContext>,
    Path(env): Path<String>,
) -> PtuResult<Json<VerifiedAccount>> {
    let env: ServerEnv = env.parse()?;
    let account = ctx.account_manager.get_verified_account(env).await?;
    Ok(Json(account))
}

/// GET /unverified_email/:env
async fn unverified_email(
    State(ctx): State<AppContext>,
    Path(env): Path<String>,
) -> PtuResult<Json<UnverifiedAccount>> {
    let env: ServerEnv = env.parse()?;
    let account = ctx.account_manager.get_unverified_account(env).await?;
    Ok(Json(account))
}

/// POST /cancel
async fn cancel(
    State(ctx): State<AppContext>,
    Json(req): Json<CancelAccountRequest>,
) -> PtuResult<Json<Value>> {
    if req.email.trim().is_empty() {
        return Err(PtuError::MissingParameter("email".to_string()));
    }
    if req.password.is_empty() {
        return Err(PtuError::MissingParameter("password".to_string()));
    }
    let result = ctx
        .account_manager
        .cancel_account(&req.email, &req.password)
        .await?;
    Ok(Json(result))
}

/// POST /assertion
async fn assertion(
    State(ctx): State<AppContext>,
    Json(req): Json<AssertionRequest>,
) -> PtuResult<Json<AssertionBundle>> {
    let bundle = ctx.assertion_issuer.issue(&req).await?;
    Ok(Json(bundle))
}
