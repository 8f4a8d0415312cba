//! Middleware layer for the imagegate service.
//!
//! This layer sits between the request surface and the provider adapters,
//! handling:
//! - **store**: In-memory presets and credentials
//! - **breaker**: Per-credential circuit breaker
//! - **keypool**: Credential selection and outcome reporting
//! - **ratelimit** / **quota** / **admission**: Request admission
//! - **route**: Preset resolution and fallback
//! - **metrics**: Execution metrics collection

pub mod admission;
pub mod breaker;
pub mod keypool;
pub mod metrics;
pub mod quota;
pub mod ratelimit;
pub mod route;
pub mod store;

// Re-export commonly used types
pub use admission::{AdmissionGate, AdmissionTicket, PolicyConfig, Rejection};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use keypool::{AcquireError, CredentialLease, KeyPool, Outcome};
pub use metrics::{ExecutionReport, ExecutionStats};
pub use quota::{QuotaConfig, QuotaLedger, QuotaScope};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use route::PresetRouter;
pub use store::{CredentialId, CredentialStore, StoreError};
