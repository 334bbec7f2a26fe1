use std::{fmt, str::FromStr, sync::LazyLock, time::Duration};

use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// A single limit of the form `<permits>/<amount><unit>`, e.g. `2/1m`.
const LIMIT_PATTERN: &str = r"([0-9]+)/([0-9]+)([hms])";

/// A ladder of at least three comma separated `<success>:<failure>` pairs.
///
/// The first pair must carry a success limit and no failure limit, intermediate pairs
/// must carry a success limit, and the last pair may leave out either side. Whitespace
/// is only allowed around the commas.
const LADDER_PATTERN: &str = concat!(
    r"[0-9]+/[0-9]+[hms]:",
    r"(?:\s*,\s*[0-9]+/[0-9]+[hms]:(?:[0-9]+/[0-9]+[hms])?)+",
    r"\s*,\s*(?:[0-9]+/[0-9]+[hms])?:(?:[0-9]+/[0-9]+[hms])?",
);

static LIMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{LIMIT_PATTERN}$")).expect("limit pattern is a valid regex")
});

static LADDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^(?:{LADDER_PATTERN})$")).expect("ladder pattern is a valid regex")
});

static PAIR_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*,\s*").expect("pair separator is a valid regex"));

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SpecError {
    #[snafu(display("regex mismatch (pattern={pattern})"))]
    LadderMismatch { pattern: &'static str },

    #[snafu(display("regex mismatch (pattern={pattern}, limit={limit})"))]
    LimitMismatch { pattern: &'static str, limit: String },

    #[snafu(display("invalid number {text:?} in limit {limit}"))]
    InvalidNumber {
        text: String,
        limit: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("unknown time unit {unit:?} in limit {limit}"))]
    UnknownUnit { unit: String, limit: String },

    #[snafu(display("cycle period overflow in limit {limit}"))]
    PeriodOverflow { limit: String },

    #[snafu(display("cycle period {cycle_period:?} does not fit in 64-bit nanoseconds"))]
    PeriodTooLong { cycle_period: Duration },

    #[snafu(display("cycle period {cycle_period:?} is shorter than one second"))]
    PeriodTooShort { cycle_period: Duration },

    #[snafu(display("was expecting a positive permit count"))]
    ZeroPermits,

    #[snafu(display("was expecting a positive cycle period"))]
    ZeroPeriod,

    #[snafu(display(
        "was expecting failure rate limit to be lower than the one for success \
         (stage_index={stage_index}, success_spec={success_spec}, failure_spec={failure_spec})"
    ))]
    FailureRateNotLower {
        stage_index: usize,
        success_spec: LimitSpec,
        failure_spec: LimitSpec,
    },

    #[snafu(display(
        "was expecting rate limiters in ascending rate order \
         (stage_index={stage_index}, prev_success_spec={prev_success_spec}, \
         next_success_spec={next_success_spec})"
    ))]
    NonAscendingSuccessRates {
        stage_index: usize,
        prev_success_spec: LimitSpec,
        next_success_spec: LimitSpec,
    },
}

/// Raised when a controller cannot be built from its spec. Wraps the underlying
/// [`SpecError`] together with the controller name.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("spec parse failure (name={name}, spec={spec})"))]
    SpecParse {
        name: String,
        spec: String,
        source: SpecError,
    },
}

/// A parsed `<permits>/<amount><unit>` limit. Displays as the text it was parsed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitSpec {
    text: String,
    max_permits_per_cycle: u32,
    cycle_period: Duration,
}

impl LimitSpec {
    pub const fn max_permits_per_cycle(&self) -> u32 {
        self.max_permits_per_cycle
    }

    pub const fn cycle_period(&self) -> Duration {
        self.cycle_period
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for LimitSpec {
    type Err = SpecError;

    fn from_str(limit: &str) -> Result<Self, Self::Err> {
        let captures = LIMIT_REGEX.captures(limit).context(LimitMismatchSnafu {
            pattern: LIMIT_PATTERN,
            limit,
        })?;

        let max_permits_per_cycle: u32 = captures[1]
            .parse()
            .context(InvalidNumberSnafu { text: &captures[1], limit })?;
        let amount: u64 = captures[2]
            .parse()
            .context(InvalidNumberSnafu { text: &captures[2], limit })?;
        let unit_secs: u64 = match &captures[3] {
            "h" => 60 * 60,
            "m" => 60,
            "s" => 1,
            unit => return UnknownUnitSnafu { unit, limit }.fail(),
        };
        let period_secs = amount
            .checked_mul(unit_secs)
            .context(PeriodOverflowSnafu { limit })?;

        ensure!(max_permits_per_cycle > 0, ZeroPermitsSnafu);
        ensure!(period_secs > 0, ZeroPeriodSnafu);

        Ok(Self {
            text: limit.to_owned(),
            max_permits_per_cycle,
            cycle_period: Duration::from_secs(period_secs),
        })
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One `<success>:<failure>` pair of a ladder; either side may be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StageSpec {
    pub(crate) success: Option<LimitSpec>,
    pub(crate) failure: Option<LimitSpec>,
}

/// Splits a ladder spec into its stages, slowest first.
///
/// Only the grammar is checked here; rate ordering is checked once limiters exist.
pub(crate) fn parse_ladder(spec: &str) -> Result<Vec<StageSpec>, SpecError> {
    ensure!(
        LADDER_REGEX.is_match(spec),
        LadderMismatchSnafu { pattern: LADDER_PATTERN }
    );
    PAIR_SEPARATOR
        .split(spec.trim())
        .map(|pair| {
            let (success, failure) = pair
                .split_once(':')
                .context(LadderMismatchSnafu { pattern: LADDER_PATTERN })?;
            Ok(StageSpec {
                success: parse_side(success)?,
                failure: parse_side(failure)?,
            })
        })
        .collect()
}

fn parse_side(side: &str) -> Result<Option<LimitSpec>, SpecError> {
    let side = side.trim();
    if side.is_empty() {
        Ok(None)
    } else {
        side.parse().map(Some)
    }
}
