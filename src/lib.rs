/// Persona test user service
///
/// Issues disposable test identities for exercising an IdP: fresh
/// unverified accounts with their verification token, verified accounts
/// once the IdP confirms them, cancellation, and signed assertions for any
/// audience.

pub mod account;
pub mod api;
pub mod assertion;
pub mod availability;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod idp;
pub mod jobs;
pub mod metrics;
pub mod names;
pub mod server;
pub mod store;
pub mod verifier;
pub mod waiter;

pub use account::{AccountManager, UnverifiedAccount, VerifiedAccount};
pub use assertion::{AssertionBundle, AssertionIssuer, AssertionRequest};
pub use availability::AvailabilityTable;
pub use config::{ServerConfig, ServerEnv};
pub use context::AppContext;
pub use error::{PtuError, PtuResult};
pub use waiter::{BoundedWaiter, WaitOutcome};
