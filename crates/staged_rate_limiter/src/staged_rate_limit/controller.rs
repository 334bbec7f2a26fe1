use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use ordered_float::OrderedFloat;
use snafu::ResultExt;

use super::{
    internal_event::{
        Direction, StageChangeData, StagedRateFailureReported, StagedRatePermitWait,
        StagedRateStageChanged,
    },
    permit_limiter::{PermitLimiter, RateLimit},
    spec::{
        ConfigError, FailureRateNotLowerSnafu, LimitSpec, NonAscendingSuccessRatesSnafu,
        SpecError, SpecParseSnafu, parse_ladder,
    },
};

/// Builds the limiter of one side of a stage from its permit count and cycle period.
pub type LimiterFactory =
    dyn Fn(u32, Duration) -> Result<Box<dyn RateLimit>, SpecError> + Send + Sync;

struct StageLimit {
    spec: LimitSpec,
    limiter: Box<dyn RateLimit>,
}

impl StageLimit {
    fn rate(&self) -> OrderedFloat<f64> {
        OrderedFloat(self.limiter.max_permits_per_second())
    }
}

struct Stage {
    success: Option<StageLimit>,
    failure: Option<StageLimit>,
}

/// Adaptive rate controller walking a ladder of stages, slowest first.
///
/// Consumers call [`claim_permit`](Self::claim_permit) after every successful unit of
/// work and [`report_failure`](Self::report_failure) after every failed one. Exhausting
/// the success budget of the active stage moves one stage faster; exhausting its failure
/// budget moves one stage slower. The controller starts at the fastest stage.
pub struct StagedRateController {
    name: String,
    spec: String,
    stages: Vec<Stage>,
    active_index: Mutex<usize>,
    permit_wait: StagedRatePermitWait,
    stage_changed: StagedRateStageChanged,
    failure_reported: StagedRateFailureReported,
}

impl StagedRateController {
    pub fn new(name: impl Into<String>, spec: impl Into<String>) -> Result<Self, ConfigError> {
        Self::with_factory(name, spec, &|max_permits, cycle_period| {
            let limiter = PermitLimiter::new(max_permits, cycle_period)?;
            Ok(Box::new(limiter) as Box<dyn RateLimit>)
        })
    }

    /// Like [`new`](Self::new), with every stage limiter built by `factory`.
    pub fn with_factory(
        name: impl Into<String>,
        spec: impl Into<String>,
        factory: &LimiterFactory,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let spec = spec.into();
        let stages = build_stages(&spec, factory).context(SpecParseSnafu {
            name: &name,
            spec: &spec,
        })?;

        let active_index = stages.len() - 1;
        let permit_wait = StagedRatePermitWait::register(name.clone());
        let stage_changed = StagedRateStageChanged::register(name.clone());
        let failure_reported = StagedRateFailureReported::register(name.clone());

        let controller = Self {
            name,
            spec,
            stages,
            active_index: Mutex::new(active_index),
            permit_wait,
            stage_changed,
            failure_reported,
        };
        debug!(
            name = %controller.name,
            spec = %controller.spec,
            stage_count = controller.stages.len(),
            "Staged rate controller created"
        );
        Ok(controller)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn active_stage_index(&self) -> usize {
        *self.lock_active_index()
    }

    pub fn active_success_spec(&self) -> Option<String> {
        let active_index = self.lock_active_index();
        self.stages[*active_index]
            .success
            .as_ref()
            .map(|limit| limit.spec.to_string())
    }

    pub fn active_failure_spec(&self) -> Option<String> {
        let active_index = self.lock_active_index();
        self.stages[*active_index]
            .failure
            .as_ref()
            .map(|limit| limit.spec.to_string())
    }

    /// Claims a success permit and returns how long the caller should wait before its
    /// next unit of work.
    ///
    /// An exhausted success budget promotes the controller one stage and grants
    /// immediately; only the fastest stage ever makes the caller wait.
    pub fn claim_permit(&self) -> Duration {
        let mut active_index = self.lock_active_index();
        let wait_nanos = self.stages[*active_index]
            .success
            .as_ref()
            .map_or(0, |limit| limit.limiter.next_wait_nanos());

        let wait = if wait_nanos == 0 {
            Duration::ZERO
        } else if *active_index + 1 < self.stages.len() {
            self.shift(&mut active_index, Direction::Up);
            Duration::ZERO
        } else {
            Duration::from_nanos(wait_nanos)
        };
        drop(active_index);

        self.permit_wait.emit(wait);
        wait
    }

    /// Records a failed unit of work, demoting the controller one stage when the active
    /// stage cannot absorb it.
    pub fn report_failure(&self) {
        let mut active_index = self.lock_active_index();
        self.failure_reported.emit(*active_index);

        let absorbed = self.stages[*active_index]
            .failure
            .as_ref()
            .is_some_and(|limit| limit.limiter.next_wait_nanos() == 0);
        if !absorbed && *active_index > 0 {
            self.shift(&mut active_index, Direction::Down);
        }
    }

    fn shift(&self, active_index: &mut MutexGuard<'_, usize>, direction: Direction) {
        **active_index = match direction {
            Direction::Up => **active_index + 1,
            Direction::Down => **active_index - 1,
        };
        let stage = &self.stages[**active_index];
        self.stage_changed.emit(StageChangeData {
            direction,
            stage_index: **active_index,
            success_spec: stage.success.as_ref().map(|limit| &limit.spec),
            failure_spec: stage.failure.as_ref().map(|limit| &limit.spec),
        });
    }

    fn lock_active_index(&self) -> MutexGuard<'_, usize> {
        // The index is always valid, so a panic elsewhere cannot leave it inconsistent.
        self.active_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for StagedRateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedRateController")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("stage_count", &self.stages.len())
            .field("active_index", &self.active_stage_index())
            .finish()
    }
}

fn build_stages(spec: &str, factory: &LimiterFactory) -> Result<Vec<Stage>, SpecError> {
    let build_limit = |spec: Option<LimitSpec>| -> Result<Option<StageLimit>, SpecError> {
        spec.map(|spec| {
            let limiter = factory(spec.max_permits_per_cycle(), spec.cycle_period())?;
            Ok(StageLimit { spec, limiter })
        })
        .transpose()
    };

    let stages = parse_ladder(spec)?
        .into_iter()
        .map(|stage| {
            Ok(Stage {
                success: build_limit(stage.success)?,
                failure: build_limit(stage.failure)?,
            })
        })
        .collect::<Result<Vec<_>, SpecError>>()?;

    for (stage_index, stage) in stages.iter().enumerate() {
        if let (Some(success), Some(failure)) = (&stage.success, &stage.failure) {
            snafu::ensure!(
                failure.rate() < success.rate(),
                FailureRateNotLowerSnafu {
                    stage_index,
                    success_spec: success.spec.clone(),
                    failure_spec: failure.spec.clone(),
                }
            );
        }
    }

    let mut prev_success: Option<&StageLimit> = None;
    for (stage_index, stage) in stages.iter().enumerate() {
        let Some(success) = &stage.success else {
            continue;
        };
        if let Some(prev) = prev_success {
            snafu::ensure!(
                prev.rate() < success.rate(),
                NonAscendingSuccessRatesSnafu {
                    stage_index,
                    prev_success_spec: prev.spec.clone(),
                    next_success_spec: success.spec.clone(),
                }
            );
        }
        prev_success = Some(success);
    }

    Ok(stages)
}
