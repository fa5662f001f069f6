use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::metrics;

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::expiry_sweep_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Retire expired accounts (runs every `sweep_interval_secs`)
    async fn expiry_sweep_job(scheduler: Arc<Self>) {
        let period = scheduler.context.config.accounts.sweep_interval_secs.max(1);
        let mut interval = interval(Duration::from_secs(period));

        loop {
            interval.tick().await;
            debug!("Running expiry sweep");

            match tasks::sweep_expired_accounts(&scheduler.context).await {
                Ok(count) => {
                    metrics::record_background_job("expiry_sweep", "success");
                    if count > 0 {
                        info!("Retired {} expired accounts", count);
                    }
                }
                Err(e) => {
                    metrics::record_background_job("expiry_sweep", "failure");
                    error!("Failed to sweep expired accounts: {}", e);
                }
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    metrics::record_background_job("health_check", "success");
                }
                Err(e) => {
                    metrics::record_background_job("health_check", "failure");
                    error!("Health check failed: {}", e);
                }
            }
        }
    }
}
