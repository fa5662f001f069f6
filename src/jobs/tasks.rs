/// Background task implementations
use crate::{context::AppContext, error::PtuResult, metrics};
use chrono::Utc;

/// Retire expired accounts and forget their ready markers
pub async fn sweep_expired_accounts(ctx: &AppContext) -> PtuResult<usize> {
    let retired = ctx.store.sweep_expired(Utc::now()).await?;
    if retired.is_empty() {
        return Ok(0);
    }

    ctx.availability.evict(&retired);
    metrics::record_accounts_swept(retired.len());

    Ok(retired.len())
}

/// Health check - verify the account store answers
pub async fn health_check(ctx: &AppContext) -> PtuResult<()> {
    ctx.store.ping().await
}
