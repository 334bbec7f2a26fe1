use std::{
    sync::Arc,
    task::{Context, Poll},
};

use tower::Service;

use super::{StagedRateController, future::ResponseFuture};

/// Service decorator feeding every outcome of the inner service into a
/// [`StagedRateController`].
///
/// A successful response claims a permit and is held back for the returned wait; a
/// failed one is reported and returned right away.
#[derive(Debug)]
pub struct StagedRateLimit<S> {
    inner: S,
    controller: Arc<StagedRateController>,
}

impl<S> StagedRateLimit<S> {
    pub const fn new(inner: S, controller: Arc<StagedRateController>) -> Self {
        Self { inner, controller }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Clone> Clone for StagedRateLimit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: Arc::clone(&self.controller),
        }
    }
}

impl<S, Request> Service<Request> for StagedRateLimit<S>
where
    S: Service<Request>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        ResponseFuture::new(self.inner.call(request), Arc::clone(&self.controller))
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, time::Duration};

    use tokio::time;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};
    use tower_test::{assert_request_eq, mock};

    use super::*;
    use crate::staged_rate_limit::{RateLimit, SpecError, StagedRateLimitLayer};

    /// A limiter that always asks for the same wait.
    struct FixedWait {
        max_permits_per_second: f64,
    }

    impl RateLimit for FixedWait {
        fn next_wait_nanos(&self) -> u64 {
            Duration::from_secs(5).as_nanos() as u64
        }

        fn max_permits_per_second(&self) -> f64 {
            self.max_permits_per_second
        }
    }

    fn fixed_wait(max_permits: u32, cycle_period: Duration) -> Result<Box<dyn RateLimit>, SpecError> {
        Ok(Box::new(FixedWait {
            max_permits_per_second: f64::from(max_permits) / cycle_period.as_secs_f64(),
        }))
    }

    #[derive(Debug)]
    struct Failed;

    impl fmt::Display for Failed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("failed")
        }
    }

    impl std::error::Error for Failed {}

    fn controller(spec: &str) -> Arc<StagedRateController> {
        Arc::new(StagedRateController::with_factory("test", spec, &fixed_wait).unwrap())
    }

    #[tokio::test]
    async fn holds_response_back_at_fastest_stage() {
        time::pause();

        let controller = controller("2/1h:, 2/1m:, 2/1s:");
        let (mut svc, mut handle) = mock::spawn_layer(StagedRateLimitLayer::new(controller));

        assert_ready_ok!(svc.poll_ready());
        let mut fut = task::spawn(svc.call("hello"));
        assert_request_eq!(handle, "hello").send_response("world");

        assert_pending!(fut.poll());
        time::advance(Duration::from_secs(4)).await;
        assert_pending!(fut.poll());
        // Sleep deadlines round up to the next millisecond.
        time::advance(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert_eq!(assert_ready_ok!(fut.poll()), "world");
    }

    #[tokio::test]
    async fn unlimited_stage_passes_responses_through() {
        let controller = controller("2/1h:, 2/1m:, :");
        let (mut svc, mut handle) = mock::spawn_layer(StagedRateLimitLayer::new(controller));

        assert_ready_ok!(svc.poll_ready());
        let mut fut = task::spawn(svc.call("hello"));
        assert_request_eq!(handle, "hello").send_response("world");
        assert_eq!(assert_ready_ok!(fut.poll()), "world");
    }

    #[tokio::test]
    async fn promotion_passes_response_through() {
        let controller = controller("2/1h:, 2/1m:, :");
        controller.report_failure();
        assert_eq!(controller.active_stage_index(), 1);

        let (mut svc, mut handle) =
            mock::spawn_layer(StagedRateLimitLayer::new(Arc::clone(&controller)));

        assert_ready_ok!(svc.poll_ready());
        let mut fut = task::spawn(svc.call("hello"));
        assert_request_eq!(handle, "hello").send_response("world");
        assert_eq!(assert_ready_ok!(fut.poll()), "world");
        assert_eq!(controller.active_stage_index(), 2);
    }

    #[tokio::test]
    async fn errors_report_failure() {
        let controller = controller("2/1h:, 2/1m:, 2/1s:");
        let (mut svc, mut handle) =
            mock::spawn_layer::<&str, &str, _>(StagedRateLimitLayer::new(Arc::clone(&controller)));

        assert_ready_ok!(svc.poll_ready());
        let mut fut = task::spawn(svc.call("hello"));
        assert_request_eq!(handle, "hello").send_error(Failed);
        assert_ready_err!(fut.poll());

        assert_eq!(controller.active_success_spec().as_deref(), Some("2/1m"));
    }
}
