use std::sync::Arc;

use tower::Layer;

use super::{StagedRateController, service::StagedRateLimit};

/// Enforces the pace of a [`StagedRateController`] on the underlying service.
///
/// Several layers may share one controller so that all of them adapt together.
#[derive(Clone, Debug)]
pub struct StagedRateLimitLayer {
    controller: Arc<StagedRateController>,
}

impl StagedRateLimitLayer {
    pub const fn new(controller: Arc<StagedRateController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<StagedRateController> {
        &self.controller
    }
}

impl<S> Layer<S> for StagedRateLimitLayer {
    type Service = StagedRateLimit<S>;

    fn layer(&self, service: S) -> Self::Service {
        StagedRateLimit::new(service, Arc::clone(&self.controller))
    }
}
