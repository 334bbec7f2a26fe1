//! Throttle work adaptively through a ladder of success/failure permit stages.

mod controller;
mod future;
pub mod internal_event;
pub mod layer;
mod permit_limiter;
pub mod service;
mod spec;

use std::{sync::OnceLock, time::Duration};

use tokio::time::Instant;

pub use controller::{LimiterFactory, StagedRateController};
pub use layer::StagedRateLimitLayer;
pub use permit_limiter::{PermitLimiter, RateLimit};
pub use service::StagedRateLimit;
pub use spec::{ConfigError, LimitSpec, SpecError};

/// Stage ladder used when no spec is configured: once a minute, twice a minute tolerating
/// one failure a minute, once a second tolerating two failures a minute, and unlimited
/// tolerating one failure every three minutes.
pub const DEFAULT_SPEC: &str = "1/1m:, 1/30s:1/1m, 1/1s:2/1m, :1/3m";

fn instant_now() -> Instant {
    tokio::time::Instant::now()
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Time elapsed since the process-wide origin shared by every permit limiter.
///
/// The origin is fixed by the first call and never changes, so cycle boundaries of
/// different limiters line up and are immune to wall-clock adjustments.
pub(crate) fn elapsed_since_epoch() -> Duration {
    let epoch = *EPOCH.get_or_init(instant_now);
    instant_now().saturating_duration_since(epoch)
}
