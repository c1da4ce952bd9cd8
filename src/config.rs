//! Configuration parameters of the library.

use std::time::Duration;

/// Number of "round trips" that the current thread makes across available
/// CPUs when calculating the enclosing TSC range.
pub(crate) const TSC_RANGE_ROUND_COUNT: usize = 100;

/// Number of "round trips" that the current thread makes across available
/// CPUs when evaluating TSC monotonicity.
pub(crate) const MONOTONICITY_ROUND_COUNT: usize = 100;

/// Number of CAS-ordered TSC probes collected on each available CPU when
/// calculating a range of values that a shift between TSC counters of two
/// different CPUs may take.
pub(crate) const TSC_RANGE_PROBES_COUNT: usize = 1000;

/// Number of CAS-ordered TSC probes collected on each available CPU when
/// evaluating TSC monotonicity.
pub(crate) const MONOTONICITY_PROBES_COUNT: usize = 1000;

/// A threshold used to verify statistical significance of a calculated TSC
/// delta range.
///
/// Given a globally ordered sequence of TSC probes collected on two CPUs, it
/// may be possible to produce several independent estimations of the range
/// of values that the shift between the two counters can take (one per
/// sub-sequence of probes enclosed between successive probes of the base
/// CPU). The ranges are intersected into a single final estimation. The more
/// independent estimations the sequence allows, the more accurate and
/// statistically significant the final result. This value is the number of
/// independent range estimations that a probe sequence must allow for the
/// combined estimation to be trusted.
pub(crate) const DELTA_RANGE_COUNT_THRESHOLD: u64 = 10;

/// A threshold used to assess statistical significance of a positive TSC
/// monotonicity result.
///
/// The criterion for a well-mixed probe sequence used here is the "full
/// loop": a sub-sequence of successive probes that starts and ends on the
/// same CPU and visits every available CPU at least once in between. A
/// positive monotonicity result is trusted only if at least this many
/// non-overlapping full loops can be found in the complete sequence.
/// (A negative result needs no such assessment: a decrease was observed for
/// sure.)
pub(crate) const FULL_LOOP_COUNT_THRESHOLD: u64 = 10;

/// The number of measurements to take when calculating how many times the
/// TSC ticks during a second-long time period.
///
/// TSC and system time cannot be read simultaneously; syscall overhead,
/// interrupts, and context switches all disturb individual measurements.
/// The library compensates by taking multiple samples and applying basic
/// statistics to them.
pub(crate) const TSC_PER_SEC_SAMPLE_COUNT: usize = 30;

/// System time period (in microseconds) that is matched with a change of the
/// TSC when measuring the tick rate. The measured ticks-per-period value is
/// then scaled to ticks-per-second.
pub(crate) const TIME_PERIOD_TO_MATCH_WITH_TSC_USECS: u64 = 500_000;

/// A time period (in seconds) used to calculate TSC-to-nanoseconds
/// conversion parameters.
///
/// The "modulus" splits the tick count to be converted into a part that
/// corresponds to a multiple of the modulus period and a remainder; the two
/// parts are converted with different (but both division-free) procedures.
/// The accuracy of the conversion depends on this value.
pub(crate) const TIME_CONVERSION_MODULUS_SECS: u64 = 10;

/// Time that TSC probe threads are allowed to execute. Threads that don't
/// finish within this budget are asked to stop.
pub(crate) const PROBE_RUN_BUDGET: Duration = Duration::from_secs(300);

/// Period between successive checks for completion of TSC probe threads.
///
/// Should be significantly smaller than [`PROBE_RUN_BUDGET`] but large
/// enough that the waiting thread doesn't steal CPU cycles from the probe
/// threads.
pub(crate) const PROBE_JOIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Maximum time to wait for stopped TSC probe threads to finish. Threads
/// that don't finish within this budget are left behind detached.
pub(crate) const PROBE_CANCEL_BUDGET: Duration = Duration::from_secs(10);
