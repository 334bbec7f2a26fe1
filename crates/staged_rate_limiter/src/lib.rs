//! Adaptive rate limiting using a ladder of success/failure permit stages
//!
//! This crate provides a rate controller that a consumer (e.g. a Pub/Sub subscriber)
//! consults after every unit of work, without any central coordinator telling it the
//! right rate.
//!
//! # Algorithm Overview
//!
//! The controller holds an ordered list of stages, slowest first. Each stage pairs an
//! optional *success* permit limiter with an optional *failure* permit limiter:
//! 1. **Speed up**: when successful work exhausts the active stage's success budget,
//!    the traffic level is deemed safe and the next faster stage becomes active
//! 2. **Slow down**: when failures exhaust the active stage's failure budget (or the
//!    stage tolerates no failures at all), the next slower stage becomes active
//!
//! Stages are described with a compact spec, e.g. `1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m`.
//!
//! # Safety & Concurrency
//! - Permit limiters are lock-free: a packed state word swapped by compare-and-swap
//! - The active stage index is the only shared mutable value, guarded by one mutex
//! - No unsafe code
//!
//! # Basic Usage
//! ```
//! use staged_rate_limiter::staged_rate_limit::StagedRateController;
//!
//! let controller = StagedRateController::new("project/subscription", "1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m")
//!     .expect("valid spec");
//! assert_eq!(controller.active_failure_spec().as_deref(), Some("1/3m"));
//!
//! let wait = controller.claim_permit();
//! assert!(wait.is_zero());
//! ```
//!
//! # Metrics
//! Emits metrics through the `metrics` facade; see [`staged_rate_limit::internal_event`].
pub mod staged_rate_limit;

#[macro_use]
extern crate tracing;
