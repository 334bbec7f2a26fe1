use std::{fmt, time::Duration};

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::staged_rate_limit::LimitSpec;

/// Which way the active stage moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StageChangeData<'a> {
    pub direction: Direction,
    pub stage_index: usize,
    pub success_spec: Option<&'a LimitSpec>,
    pub failure_spec: Option<&'a LimitSpec>,
}

registered_event! {
    StagedRatePermitWait { name: String } => {
        // A histogram, so the distribution of throttling delays stays visible.
        permit_wait: Histogram = histogram!("staged_rate_limiter_permit_wait_nanos", "name" => name.clone()),
    }

    fn emit(&self, wait: Duration) {
        self.permit_wait.record(wait.as_nanos() as f64);
        tracing::trace!(
            target: "staged_rate_limiter::stats",
            name = %self.name,
            permit_wait_ms = wait.as_millis(),
            "Permit Claimed"
        );
    }
}

registered_event! {
    StagedRateStageChanged { name: String } => {
        active_stage: Gauge = gauge!("staged_rate_limiter_active_stage", "name" => name.clone()),
    }

    fn emit(&self, data: StageChangeData<'_>) {
        self.active_stage.set(data.stage_index as f64);
        tracing::info!(
            name = %self.name,
            direction = %data.direction,
            stage_index = data.stage_index,
            success_spec = data.success_spec.map(LimitSpec::as_str),
            failure_spec = data.failure_spec.map(LimitSpec::as_str),
            "adjusting rate"
        );
    }
}

registered_event! {
    StagedRateFailureReported { name: String } => {
        failures: Counter = counter!("staged_rate_limiter_failures_total", "name" => name.clone()),
    }

    fn emit(&self, stage_index: usize) {
        self.failures.increment(1);
        tracing::debug!(
            target: "staged_rate_limiter::stats",
            name = %self.name,
            stage_index,
            "Failure Reported"
        );
    }
}
