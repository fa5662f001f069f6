/// Persona test user service
///
/// Hands out disposable accounts and assertions for testing Persona IdPs.

use persona_testuser::{config::ServerConfig, context::AppContext, error::PtuResult, jobs, server};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> PtuResult<()> {
    // Load configuration
    let config = ServerConfig::from_env()?;

    // Initialize logging
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    println!(
        "\n        Persona Test User Service v{}\n",
        env!("CARGO_PKG_VERSION")
    );

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Listen for verification events
    let _feeds = ctx.notifier.start();

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}
