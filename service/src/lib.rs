//! ImageGate Service - quota-aware image generation gateway
//!
//! Sits between chat-originated generation requests and external image
//! backends:
//! - Admission control (black/white lists, token buckets, daily quotas)
//! - Per-credential circuit breakers and round-robin key rotation
//! - Retry, backoff and preset failover under a single request deadline
//! - Execution metrics and a daily usage leaderboard
//!
//! Prompt construction, command parsing and reply rendering live elsewhere;
//! this crate takes a resolved [`request::GenerationRequest`] and returns a
//! [`request::GenerationResult`].

pub mod clock;
pub mod config;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod providers;
pub mod request;

pub use config::GatewayConfig;
pub use error::{ErrorKind, GenerationError};
pub use orchestrator::RequestOrchestrator;
pub use request::{AdmissionScope, GenerationRequest, GenerationResult};
