//! TSC reliability evaluation based on the "CPU switching" method: a single
//! thread jumps from one CPU to another in a carousel manner and takes all
//! the needed measurements itself.
//!
//! The carousel guarantees a deterministic CPU order at the cost of one
//! thread-migration latency between successive reads.

use log::{debug, info, log_enabled, trace, Level};

use crate::config::{MONOTONICITY_ROUND_COUNT, TSC_RANGE_ROUND_COUNT};
use crate::error::{Error, Result};
use crate::proc_state::{pin_current_thread, with_restored_state, ProcAndSysState};
use crate::range::DeltaRange;
use crate::{get_tsc, ReliabilityEstimate};

/// TSC values collected by migrating the current thread across a fixed CPU
/// list in rounds.
///
/// `vals[0]` carries one extra trailing sample, taken on the first CPU after
/// the last round, so that the first and last measurements of the whole
/// sequence come from the same CPU. Hence `vals[0].len() == rounds + 1`
/// while every other series has `rounds` elements.
struct CarouselSamples {
    vals: Vec<Vec<u64>>,
}

impl CarouselSamples {
    fn rounds(&self) -> usize {
        self.vals[0].len() - 1
    }
}

/// Move the current thread across `cpu_ids` in a carousel fashion, reading
/// the TSC once after each migration, for `num_rounds` rounds plus the
/// trailing read on the first CPU.
///
/// CPU affinity of the current thread changes as a result of this call.
fn collect_carousel_samples(cpu_ids: &[usize], num_rounds: usize) -> Result<CarouselSamples> {
    let mut vals: Vec<Vec<u64>> = (0..cpu_ids.len())
        .map(|_| Vec::with_capacity(num_rounds + 1))
        .collect();

    for _ in 0..num_rounds {
        for (ind, &cpu_id) in cpu_ids.iter().enumerate() {
            pin_current_thread(cpu_id)
                .map_err(|e| e.context("couldn't change CPU affinity of the current thread"))?;
            vals[ind].push(get_tsc().0);
        }
    }

    pin_current_thread(cpu_ids[0])
        .map_err(|e| e.context("couldn't change CPU affinity of the current thread"))?;
    vals[0].push(get_tsc().0);

    Ok(CarouselSamples { vals })
}

fn dump_carousel_samples(samples: &CarouselSamples) {
    if !log_enabled!(Level::Trace) {
        return;
    }

    trace!("TSC samples collected in the CPU carousel");
    trace!("(CPU index may not be equal to CPU ID; the mapping is logged above)");

    let num_rounds = samples.rounds();

    for round in 0..num_rounds {
        for (cpu_ind, series) in samples.vals.iter().enumerate() {
            trace!("round {round}, CPU index {cpu_ind}: {}", series[round]);
        }
    }

    trace!("round {num_rounds}, CPU index 0: {}", samples.vals[0][num_rounds]);
}

/// Make sure the collected TSC values do vary on each of the CPUs.
///
/// That may not be true, for example, when some CPU consistently returns
/// zero for every TSC read. A counter that doesn't move would pass both the
/// delta-range and the monotonicity examinations perfectly while being
/// useless for measuring time: the library requires TSC values to grow on a
/// global scale and not decrease locally, so runs of equal values are
/// otherwise acceptable.
fn check_carousel_consistency(samples: &CarouselSamples) -> Result<()> {
    for (cpu_ind, series) in samples.vals.iter().enumerate() {
        if series.first() == series.last() {
            return Err(Error::Inconsistency(format!(
                "first and last TSC values collected on a CPU with index {cpu_ind} are equal"
            )));
        }
    }

    Ok(())
}

/// Calculate bounds of the shift between TSC on the given CPU and TSC on the
/// base CPU from one two-CPU carousel.
///
/// Each TSC value `T` measured on the given CPU sits between the values `t1`
/// and `t2` measured right before and right after it on the base CPU. When
/// `T` was taken, the base counter held some `t` in `[t1, t2]`, so the shift
/// `delta = T - t` lies in `[T - t2, T - t1]`. Every round yields one such
/// interval; the intervals from all rounds must mutually intersect, and
/// their intersection is the tightest estimate the carousel can give.
///
/// `base` is the series collected on the base CPU (with the extra trailing
/// sample), `other` the series collected on the other CPU during the same
/// carousel.
fn calc_tsc_delta_range_cpu_switch(base: &[u64], other: &[u64]) -> Result<DeltaRange> {
    let num_rounds = other.len();

    debug!("calculating shift between TSC counters of the two given CPUs");

    if base.first() == base.last() || other.first() == other.last() {
        return Err(Error::Inconsistency(
            "first and last TSC values collected on one of the CPUs are equal".into(),
        ));
    }

    let mut range = DeltaRange::FULL;

    for i in 0..num_rounds {
        // Successive TSC values measured on the same CPU must not decrease
        // (unless the counter wraps).
        if base[i + 1] < base[i] || (i > 0 && other[i] < other[i - 1]) {
            return Err(Error::Inconsistency(
                "detected decreasing successive TSC values (measured on the same CPU); \
                 may be a result of TSC wrap"
                    .into(),
            ));
        }

        // A cross-CPU difference that doesn't fit i64 cannot be a plausible
        // shift. The monotonicity check above only rules out a wrap DURING
        // the carousel; one CPU may have wrapped right before it while
        // another is still approaching its wrap point, and then the two
        // counters sit on opposite sides of the wrap for the whole run.
        if u64::abs_diff(other[i], base[i]) > i64::MAX as u64
            || u64::abs_diff(other[i], base[i + 1]) > i64::MAX as u64
        {
            return Err(Error::Inconsistency(format!(
                "difference between TSC values measured on different CPUs is bigger than {}; \
                 may be a result of TSC wrap",
                i64::MAX
            )));
        }

        let bound = DeltaRange {
            lo: other[i].wrapping_sub(base[i + 1]) as i64,
            hi: other[i].wrapping_sub(base[i]) as i64,
        };

        range = range.intersect(bound).ok_or_else(|| {
            Error::Inconsistency(
                "TSC delta ranges calculated for different carousel rounds don't overlap".into(),
            )
        })?;

        trace!(
            "the shift belongs to range: {} [{}, {}]",
            bound.len(),
            bound.lo,
            bound.hi
        );
    }

    debug!(
        "combined range (intersection of all the above): {} [{}, {}]",
        range.len(),
        range.lo,
        range.hi
    );

    Ok(range)
}

/// Calculate the size of the enclosing TSC range: a non-negative value such
/// that if TSC values were measured simultaneously on all available CPUs,
/// the difference between the largest and the smallest would not exceed it.
///
/// For each available CPU, bounds of its shift relative to the base CPU are
/// computed from a dedicated two-CPU carousel; the smallest range enclosing
/// all the per-CPU ranges is the answer, and its width is returned.
fn calc_tsc_enclosing_range_cpu_switch(state: &ProcAndSysState) -> Result<i64> {
    let base_cpu = state.initial_cpu;
    let mut enclosing: Option<DeltaRange> = None;

    info!("calculating an upper bound for shifts between TSC counters running on different CPUs");
    debug!("base CPU ID: {base_cpu}");

    for &cpu_id in state.allowed_cpus.iter().filter(|&&c| c != base_cpu) {
        debug!("running carousel for CPUs {base_cpu} and {cpu_id}");

        let samples = collect_carousel_samples(&[base_cpu, cpu_id], TSC_RANGE_ROUND_COUNT)
            .map_err(|e| e.context("CPU carousel failed"))?;

        debug!("CPU ID {base_cpu} maps to CPU index 0");
        debug!("CPU ID {cpu_id} maps to CPU index 1");
        dump_carousel_samples(&samples);

        let range = calc_tsc_delta_range_cpu_switch(&samples.vals[0], &samples.vals[1])
            .map_err(|e| e.context("calculation of TSC delta range failed"))?;

        enclosing = Some(match enclosing {
            Some(whole) => whole.enclose(range),
            None => range,
        });
    }

    // The caller guarantees at least two allowed CPUs.
    let enclosing = enclosing.ok_or_else(|| {
        Error::Environment("no CPU to compare TSC values against the base CPU".into())
    })?;

    debug!(
        "shift between TSC on any of the available CPUs and TSC on the base CPU \
         belongs to range: [{}, {}]",
        enclosing.lo, enclosing.hi
    );
    debug!("upper bound for shifts between TSCs is: {}", enclosing.len());

    Ok(enclosing.len())
}

/// Walk the carousel sequence in the order the samples were taken and check
/// that TSC values never decrease.
fn is_carousel_sequence_monotonic(samples: &CarouselSamples) -> bool {
    let num_rounds = samples.rounds();
    let mut prev_tsc_val = samples.vals[0][0];

    for round in 0..num_rounds {
        for (cpu_ind, series) in samples.vals.iter().enumerate() {
            if series[round] < prev_tsc_val {
                debug!("monotonic increase broke at carousel round {round}, CPU index {cpu_ind}");

                return false;
            }

            prev_tsc_val = series[round];
        }
    }

    // The trailing sample brackets the whole sequence: it was taken on the
    // same CPU as the very first one. This check carries little weight for
    // large round counts but is critical when there is a single round.
    if samples.vals[0][num_rounds] < prev_tsc_val {
        debug!("monotonic increase broke at the trailing carousel sample");

        return false;
    }

    true
}

/// Check whether TSC values measured on different CPUs one after another
/// monotonically increase: run the carousel over all available CPUs and scan
/// the collected values in collection order.
///
/// A negative answer doesn't necessarily imply that the TSCs are unreliable;
/// the observed decrease may be a result of TSC wrap.
fn eval_tsc_monotonicity_cpu_switch(state: &ProcAndSysState) -> Result<bool> {
    info!("evaluating TSC monotonicity");

    for (cpu_ind, &cpu_id) in state.allowed_cpus.iter().enumerate() {
        debug!("CPU ID {cpu_id} maps to CPU index {cpu_ind}");
    }

    let samples = collect_carousel_samples(&state.allowed_cpus, MONOTONICITY_ROUND_COUNT)
        .map_err(|e| e.context("CPU carousel failed"))?;

    dump_carousel_samples(&samples);
    check_carousel_consistency(&samples)?;

    let is_monotonic = is_carousel_sequence_monotonic(&samples);

    if is_monotonic {
        debug!("the collected TSC values DO monotonically increase");
    }

    Ok(is_monotonic)
}

/// Evaluate TSC reliability with the data collected by the "CPU switching"
/// method.
pub(crate) fn eval_tsc_reliability_cpu_switch() -> Result<ReliabilityEstimate> {
    info!("evaluating TSC reliability (data collected using the \"CPU switching\" method)");

    let state = ProcAndSysState::capture()
        .map_err(|e| e.context("couldn't obtain details of the system and process state"))?;

    if state.allowed_cpus.len() == 1 {
        debug!(
            "CPU {} is the only one available; there is nothing to compare its TSC against",
            state.allowed_cpus[0]
        );

        return Ok(ReliabilityEstimate {
            tsc_range_length: 0,
            is_monotonic: true,
        });
    }

    with_restored_state(&state, || {
        let tsc_range_length = calc_tsc_enclosing_range_cpu_switch(&state)
            .map_err(|e| e.context("error while calculating enclosing TSC range"))?;
        let is_monotonic = eval_tsc_monotonicity_cpu_switch(&state)
            .map_err(|e| e.context("error while evaluating TSC monotonicity"))?;

        Ok(ReliabilityEstimate {
            tsc_range_length,
            is_monotonic,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // A carousel over two synthetic 2 GHz counters where the other CPU runs
    // a constant 100000 ticks ahead. Every round the base CPU is read at
    // t = 1000*i and t = 1000*i + 1000, the other CPU in between.
    fn skewed_series(rounds: usize, skew: u64) -> (Vec<u64>, Vec<u64>) {
        let base: Vec<u64> = (0..=rounds as u64).map(|i| i * 1000).collect();
        let other: Vec<u64> = (0..rounds as u64).map(|i| i * 1000 + 500 + skew).collect();

        (base, other)
    }

    #[test]
    fn delta_range_brackets_a_fixed_skew() {
        let (base, other) = skewed_series(100, 100_000);
        let range = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap();

        assert!(range.lo <= 100_000 && 100_000 <= range.hi);
        // The estimate cannot be wider than a single round.
        assert!(range.len() <= 1000);
    }

    #[test]
    fn delta_range_of_aligned_counters_stays_near_zero() {
        let (base, other) = skewed_series(100, 0);
        let range = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap();

        assert!(range.lo <= 500 && range.hi >= 500);
        assert!(range.len() <= 1000);
    }

    #[test]
    fn constant_counter_is_inconsistent() {
        let base: Vec<u64> = (0..=10u64).map(|i| i * 1000).collect();
        let other = vec![42u64; 10];

        let err = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn decreasing_counter_is_inconsistent() {
        let (mut base, other) = skewed_series(10, 0);
        base[5] = base[4] - 1;

        let err = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn implausibly_large_cross_cpu_difference_is_inconsistent() {
        // One counter seeded close to the wrap point, the other near zero.
        let base: Vec<u64> = (0..=10u64).map(|i| i * 1000).collect();
        let other: Vec<u64> = (0..10u64).map(|i| u64::MAX - 10_000 + i * 1000).collect();

        let err = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn non_overlapping_rounds_are_inconsistent() {
        // Round 0 puts the shift in [5, 15], round 1 in [20, 30].
        let base = vec![0u64, 10, 20];
        let other = vec![15u64, 40];

        let err = calc_tsc_delta_range_cpu_switch(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    fn carousel(vals: Vec<Vec<u64>>) -> CarouselSamples {
        CarouselSamples { vals }
    }

    #[test]
    fn monotonic_carousel_sequence_is_detected() {
        // Round-major order: 1 4 7, 10 13 16, then the trailing 20.
        let samples = carousel(vec![vec![1, 10, 20], vec![4, 13], vec![7, 16]]);

        assert!(is_carousel_sequence_monotonic(&samples));
    }

    #[test]
    fn single_decrease_breaks_monotonicity() {
        let samples = carousel(vec![vec![1, 10, 20], vec![4, 9], vec![7, 16]]);

        assert!(!is_carousel_sequence_monotonic(&samples));
    }

    #[test]
    fn decrease_at_trailing_sample_breaks_monotonicity() {
        let samples = carousel(vec![vec![1, 10, 15], vec![4, 13], vec![7, 16]]);

        assert!(!is_carousel_sequence_monotonic(&samples));
    }

    #[test]
    fn equal_first_and_last_values_fail_consistency() {
        let samples = carousel(vec![vec![1, 10, 20], vec![4, 4], vec![7, 16]]);

        let err = check_carousel_consistency(&samples).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn varying_values_pass_consistency() {
        let samples = carousel(vec![vec![1, 10, 20], vec![4, 13], vec![7, 16]]);

        assert!(check_carousel_consistency(&samples).is_ok());
    }
}
