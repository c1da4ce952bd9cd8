//! Wall-clock time measurement over the x86 Time-Stamp Counter.
//!
//! Reading the TSC costs a single unprivileged instruction, which makes it
//! the cheapest clock a user-space program can get. But on a multi-CPU
//! system the counter is only usable as a wall-clock source if it ticks at
//! the same stable rate on every CPU the process may run on, and if the
//! counters of different CPUs are not significantly shifted relative to each
//! other. None of that is guaranteed by the architecture, so this library
//! verifies it empirically:
//!
//! - [`eval_tsc_reliability_cpu_switch`] and [`eval_tsc_reliability_cas_ordered`]
//!   estimate an upper bound for the shift between the TSC counters of
//!   different CPUs and check that successively measured TSC values never
//!   decrease. The first collects its data with a single thread migrating
//!   across CPUs; the second races one pinned thread per CPU through a
//!   shared sequence counter. The two methods fail differently, so a
//!   cautious application runs both.
//! - [`get_tsc_to_nsec_conversion_params`] measures the tick rate, derives
//!   division-free tick-to-nanosecond conversion parameters, and reports
//!   how long measurements may run before the earliest counter wraps.
//!
//! The library diagnoses; it never compensates for a bad TSC. It targets
//! Linux systems where the process can be pinned to individual CPUs and
//! expects homogeneous CPUs.

mod cas_probes;
mod config;
mod conversion;
mod cpu_switch;
mod error;
mod proc_state;
mod range;

pub use conversion::{ConversionEstimate, ConversionParams};
pub use error::{Error, Result};

/// A raw time-stamp counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

/// Get the time-stamp counter.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub fn get_tsc() -> Timestamp {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::_rdtsc;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::_rdtsc;

    Timestamp(unsafe { _rdtsc() })
}

/// Outcome of a TSC reliability evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ReliabilityEstimate {
    /// Estimated maximum shift between TSC counters running on different
    /// CPUs, in ticks.
    pub tsc_range_length: i64,
    /// Whether TSC values measured successively on same or different CPUs
    /// monotonically increase.
    ///
    /// `false` doesn't necessarily imply that the TSCs are unreliable: in
    /// rare cases the observed decrease is the result of a TSC wrap that
    /// occurred right before or in the middle of the measurements.
    pub is_monotonic: bool,
}

/// Evaluate reliability of the TSC as a wall-clock time source. The required
/// data is collected using the "CPU switching" method: a single thread jumps
/// from one CPU to another and takes all the needed measurements itself.
///
/// The calling thread's CPU affinity is changed during the evaluation and
/// restored before returning, on success and failure alike. A failure to
/// restore it is reported as [`Error::Restoration`] even when the
/// measurements themselves succeeded, and the results are discarded.
pub fn eval_tsc_reliability_cpu_switch() -> Result<ReliabilityEstimate> {
    cpu_switch::eval_tsc_reliability_cpu_switch()
}

/// Evaluate reliability of the TSC as a wall-clock time source. The required
/// data is collected by concurrently running threads, one pinned to each
/// available CPU, whose measurements are sequentially ordered by means of a
/// compare-and-swap operation.
///
/// Unlike [`eval_tsc_reliability_cpu_switch`], this method needs the probes
/// of different CPUs to interleave; if they don't interleave enough, the
/// evaluation fails with [`Error::PoorStatistics`] rather than returning a
/// weakly supported answer.
pub fn eval_tsc_reliability_cas_ordered() -> Result<ReliabilityEstimate> {
    cas_probes::eval_tsc_reliability_cas_ordered()
}

/// Calculate parameters for fast and accurate conversion of TSC ticks to
/// nanoseconds, together with the time (in seconds) remaining before the
/// earliest TSC wrap among the available CPUs.
pub fn get_tsc_to_nsec_conversion_params() -> Result<ConversionEstimate> {
    conversion::get_tsc_to_nsec_conversion_params()
}
