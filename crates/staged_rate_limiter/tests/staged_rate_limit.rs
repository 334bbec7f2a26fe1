use std::{sync::Arc, time::Duration};

use staged_rate_limiter::staged_rate_limit::{
    ConfigError, SpecError, StagedRateController, StagedRateLimitLayer,
};
use tower::{ServiceBuilder, ServiceExt, service_fn};

const LADDER: &str = "1/1h:, 2/1h:1/1h, :";

#[tokio::test(start_paused = true)]
async fn walks_the_ladder_with_real_limiters() {
    let controller = StagedRateController::new("ladder", LADDER).unwrap();
    assert_eq!(controller.stage_count(), 3);
    assert_eq!(controller.active_stage_index(), 2);
    assert_eq!(controller.active_success_spec(), None);

    // The unlimited stage tolerates no failure.
    controller.report_failure();
    assert_eq!(controller.active_stage_index(), 1);
    assert_eq!(controller.active_failure_spec().as_deref(), Some("1/1h"));

    // One failure per hour is absorbed, the next one is not.
    controller.report_failure();
    assert_eq!(controller.active_stage_index(), 1);
    controller.report_failure();
    assert_eq!(controller.active_stage_index(), 0);

    // Exhausting a success budget promotes without waiting.
    assert_eq!(controller.claim_permit(), Duration::ZERO);
    assert_eq!(controller.active_stage_index(), 0);
    assert_eq!(controller.claim_permit(), Duration::ZERO);
    assert_eq!(controller.active_stage_index(), 1);

    assert_eq!(controller.claim_permit(), Duration::ZERO);
    assert_eq!(controller.claim_permit(), Duration::ZERO);
    assert_eq!(controller.active_stage_index(), 1);
    assert_eq!(controller.claim_permit(), Duration::ZERO);
    assert_eq!(controller.active_stage_index(), 2);

    for _ in 0..1_000 {
        assert_eq!(controller.claim_permit(), Duration::ZERO);
    }
    assert_eq!(controller.active_stage_index(), 2);
}

#[tokio::test(start_paused = true)]
async fn layer_reports_service_errors() {
    let controller = Arc::new(StagedRateController::new("layer", LADDER).unwrap());
    let service = ServiceBuilder::new()
        .layer(StagedRateLimitLayer::new(Arc::clone(&controller)))
        .service(service_fn(|request: u32| async move {
            if request == 0 {
                Err("rejected")
            } else {
                Ok(request * 2)
            }
        }));

    assert_eq!(service.clone().oneshot(21).await, Ok(42));
    assert_eq!(controller.active_stage_index(), 2);

    assert_eq!(service.clone().oneshot(0).await, Err("rejected"));
    assert_eq!(controller.active_stage_index(), 1);
}

#[test]
fn configuration_errors_name_the_controller() {
    let error = StagedRateController::new("orders/billing", "1/1s:, 1/1h:2/1h, :").unwrap_err();
    assert!(
        error
            .to_string()
            .starts_with("spec parse failure (name=orders/billing, spec=1/1s:, 1/1h:2/1h, :)")
    );
    let ConfigError::SpecParse { source, .. } = error;
    assert!(matches!(source, SpecError::FailureRateNotLower { .. }));
}
