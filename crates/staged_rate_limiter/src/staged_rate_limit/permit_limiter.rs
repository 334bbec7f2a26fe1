use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use snafu::{OptionExt, ensure};

use super::{
    elapsed_since_epoch,
    spec::{
        PeriodTooLongSnafu, PeriodTooShortSnafu, SpecError, ZeroPeriodSnafu, ZeroPermitsSnafu,
    },
};

/// A source of permits consulted by the staged rate controller.
///
/// [`PermitLimiter`] is the production implementation; the trait exists so the controller
/// can be driven by limiters with scripted behavior.
pub trait RateLimit: Send + Sync {
    /// Claims a permit. Returns the nanoseconds until the permit becomes available, zero
    /// meaning it is available right away.
    fn next_wait_nanos(&self) -> u64;

    /// The configured capacity expressed as permits per second.
    fn max_permits_per_second(&self) -> f64;
}

/// Permit bookkeeping of one cycle. Never mutated in place: every claim computes a new
/// value and commits it with a compare-and-swap of the packed word.
///
/// The cycle index is stored modulo 2^32; elapsed cycles are recovered with wrapping
/// arithmetic, which is only ambiguous after 2^32 idle cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CycleState {
    cycle_index: u32,
    permit_count: u32,
}

impl CycleState {
    const fn pack(self) -> u64 {
        ((self.cycle_index as u64) << 32) | self.permit_count as u64
    }

    const fn unpack(word: u64) -> Self {
        Self {
            cycle_index: (word >> 32) as u32,
            permit_count: word as u32,
        }
    }
}

/// A thread-safe limiter granting at most `max_permits_per_cycle` permits during each
/// cycle of `cycle_period`.
///
/// Cycles are counted from a process-wide monotonic origin shared by all limiters.
/// Unused permits do not carry over: replenishment is capped at one cycle's worth.
pub struct PermitLimiter {
    max_permits_per_cycle: u32,
    cycle_period: Duration,
    cycle_period_nanos: u64,
    state: AtomicU64,
}

impl PermitLimiter {
    /// Periods below one second are rejected, which keeps the 2^32 cycle wrap of the
    /// stored cycle index more than a century away.
    pub fn new(max_permits_per_cycle: u32, cycle_period: Duration) -> Result<Self, SpecError> {
        ensure!(max_permits_per_cycle > 0, ZeroPermitsSnafu);
        ensure!(!cycle_period.is_zero(), ZeroPeriodSnafu);
        ensure!(
            cycle_period >= Duration::from_secs(1),
            PeriodTooShortSnafu { cycle_period }
        );
        let cycle_period_nanos = u64::try_from(cycle_period.as_nanos())
            .ok()
            .context(PeriodTooLongSnafu { cycle_period })?;
        let initial = CycleState {
            cycle_index: 0,
            permit_count: max_permits_per_cycle,
        };
        Ok(Self {
            max_permits_per_cycle,
            cycle_period,
            cycle_period_nanos,
            state: AtomicU64::new(initial.pack()),
        })
    }

    pub const fn max_permits_per_cycle(&self) -> u32 {
        self.max_permits_per_cycle
    }

    pub const fn cycle_period(&self) -> Duration {
        self.cycle_period
    }

    /// Estimates the permits per second acquired during the current cycle.
    ///
    /// Read-only: the replenishment a claim would apply is projected, never committed.
    pub fn estimated_acquired_permits_per_second(&self) -> f64 {
        let current = CycleState::unpack(self.state.load(Ordering::Acquire));
        let current_cycle = now_nanos() / self.cycle_period_nanos;
        let projected = self.replenish(current, current_cycle);
        let acquired = self.max_permits_per_cycle - projected.permit_count;
        (1e9 * f64::from(acquired)) / self.cycle_period_nanos as f64
    }

    fn replenish(&self, state: CycleState, current_cycle: u64) -> CycleState {
        let elapsed_cycles = (current_cycle as u32).wrapping_sub(state.cycle_index);
        if elapsed_cycles == 0 {
            return state;
        }
        let accumulated = u64::from(elapsed_cycles)
            .saturating_mul(u64::from(self.max_permits_per_cycle))
            .saturating_add(u64::from(state.permit_count));
        CycleState {
            cycle_index: current_cycle as u32,
            permit_count: accumulated.min(u64::from(self.max_permits_per_cycle)) as u32,
        }
    }

    /// Side-effect free transition from `state` for a claim made at `now_nanos`.
    /// Returns the state to commit together with the wait of the claim.
    fn next_state(&self, state: CycleState, now_nanos: u64) -> (CycleState, u64) {
        let current_cycle = now_nanos / self.cycle_period_nanos;
        let mut next = self.replenish(state, current_cycle);
        if next.permit_count > 0 {
            next.permit_count -= 1;
            return (next, 0);
        }
        // Denied claims never borrow from future cycles, so the earliest grant is at the
        // start of the next cycle.
        let next_cycle_start_nanos = (current_cycle + 1).saturating_mul(self.cycle_period_nanos);
        (next, next_cycle_start_nanos - now_nanos)
    }
}

impl RateLimit for PermitLimiter {
    fn next_wait_nanos(&self) -> u64 {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (next, wait_nanos) = self.next_state(CycleState::unpack(current), now_nanos());
            match self.state.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return wait_nanos,
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn max_permits_per_second(&self) -> f64 {
        (1e9 * f64::from(self.max_permits_per_cycle)) / self.cycle_period_nanos as f64
    }
}

impl fmt::Debug for PermitLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = CycleState::unpack(self.state.load(Ordering::Relaxed));
        f.debug_struct("PermitLimiter")
            .field("max_permits_per_cycle", &self.max_permits_per_cycle)
            .field("cycle_period", &self.cycle_period)
            .field("cycle_index", &state.cycle_index)
            .field("permit_count", &state.permit_count)
            .finish()
    }
}

impl fmt::Display for PermitLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.max_permits_per_cycle, self.cycle_period)
    }
}

fn now_nanos() -> u64 {
    u64::try_from(elapsed_since_epoch().as_nanos()).unwrap_or(u64::MAX)
}
