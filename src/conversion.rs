//! Fast TSC-to-nanosecond conversion: measuring the tick rate, cleaning the
//! measurements from statistical noise, and deriving division-free
//! conversion parameters.

use std::io;
use std::mem;

use log::{debug, info};

use crate::config::{
    TIME_CONVERSION_MODULUS_SECS, TIME_PERIOD_TO_MATCH_WITH_TSC_USECS, TSC_PER_SEC_SAMPLE_COUNT,
};
use crate::error::{Error, Result};
use crate::proc_state::{pin_current_thread, with_restored_state, ProcAndSysState};
use crate::{get_tsc, Timestamp};

const NSECS_PER_SEC: u64 = 1_000_000_000;

/// A set of parameters used to convert TSC ticks into nanoseconds in a fast
/// and accurate way.
#[derive(Debug, Clone)]
pub struct ConversionParams {
    /// A multiplier: nsecs_per_tsc_remainder = (tsc_remainder * mult) >> shift.
    mult: u64,
    /// The shift of the same formula.
    shift: u32,
    /// Nanoseconds per TSC modulus: nsecs_per_tsc_moduli =
    /// (tsc_ticks >> tsc_remainder_length) * nsecs_per_tsc_modulus.
    nsecs_per_tsc_modulus: u64,
    /// Bit length of the TSC remainder. The quotient of TSC ticks divided by
    /// the TSC modulus is (tsc_ticks >> tsc_remainder_length).
    tsc_remainder_length: u32,
    /// A bitmask used to extract the TSC remainder:
    /// tsc_remainder = tsc_ticks & tsc_remainder_bitmask.
    tsc_remainder_bitmask: u64,
    /// Number of TSC ticks per second, for clients that prefer to convert
    /// ticks to (nano)seconds by means of plain integer or floating-point
    /// division.
    tsc_ticks_per_sec: u64,
}

/// Conversion parameters together with the time remaining before the
/// earliest TSC counter wraps past its 64-bit capacity.
#[derive(Debug, Clone)]
pub struct ConversionEstimate {
    pub params: ConversionParams,
    /// Seconds before the most-advanced allowed CPU's counter wraps. An
    /// interval measurement that runs longer than this cannot be converted
    /// meaningfully.
    pub secs_before_wrap: u64,
}

impl ConversionParams {
    /// Calculate conversion parameters from a ticks-per-second rate.
    ///
    /// Ideally the conversion would be `ns = ticks / ticks_per_ns`, but
    /// plain integer division is both inaccurate (ticks_per_ns is rarely an
    /// integer) and slow (10+ clocks, not always pipelined). Instead the
    /// division is carried out by a pre-computed multiply and shift:
    ///
    /// ```text
    /// ns = (ticks * mult) >> shift        where mult = 2^shift / ticks_per_ns
    /// ```
    ///
    /// The larger the factor 2^shift, the better the accuracy; the limit is
    /// that `ticks * mult` must not overflow 64 bits. So a target range has
    /// to be fixed first. A configurable period of
    /// [`TIME_CONVERSION_MODULUS_SECS`] seconds bounds that range: ticks are
    /// split into a multiple of a "TSC modulus" and a remainder shorter than
    /// the modulus period,
    ///
    /// ```text
    /// ticks = (tsc_modulus * num_moduli) + remainder
    /// ```
    ///
    /// where the modulus is the largest power of two not exceeding the tick
    /// worth of the configured period, so that `num_moduli` and `remainder`
    /// fall out of a shift and a mask. The remainder is converted by the
    /// multiply-shift above with the largest shift that cannot overflow
    /// within one modulus period; the moduli part is converted by one more
    /// multiplication with the pre-computed nanosecond worth of the modulus.
    ///
    /// The nanosecond worth of the modulus is itself computed as
    /// `(tsc_modulus * mult) >> shift` rather than the slightly more exact
    /// `tsc_modulus * 10^9 / ticks_per_sec`: with the exact value the last
    /// tick of every modulus period would be worth more nanoseconds than any
    /// other tick, and equal TSC ranges would convert to unequal nanosecond
    /// counts. Uniform accuracy wins over best-case accuracy here.
    fn from_tsc_per_sec(tsc_per_sec: u64) -> Result<Self> {
        debug!("calculating TSC-to-nanoseconds conversion parameters");

        if tsc_per_sec == 0 {
            return Err(Error::Inconsistency(
                "the measured TSC rate is zero ticks per second".into(),
            ));
        }

        if u64::MAX / TIME_CONVERSION_MODULUS_SECS < tsc_per_sec {
            return Err(Error::Environment(
                "the configured time conversion modulus is too big: the TSC worth of the \
                 period doesn't fit a 64-bit cell"
                    .into(),
            ));
        }

        let tsc_worth_of_modulus = TIME_CONVERSION_MODULUS_SECS * tsc_per_sec;
        let mult_bound = u64::MAX / tsc_worth_of_modulus;
        // No overflow: tsc_per_sec <= tsc_worth_of_modulus, and thus the
        // product is bounded by mult_bound * tsc_worth_of_modulus.
        let factor_bound = mult_bound * tsc_per_sec / NSECS_PER_SEC;

        if factor_bound == 0 {
            return Err(Error::Environment(
                "the configured time conversion modulus leaves no room for the conversion \
                 factor"
                    .into(),
            ));
        }

        // The factor is the largest power of 2 that doesn't exceed the bound.
        let shift = factor_bound.ilog2();
        let factor = 1u64 << shift;
        // Smaller than mult_bound by the choice of the factor.
        let mult = factor * NSECS_PER_SEC / tsc_per_sec;

        debug!("shift: {shift}, multiplier: {mult}");

        // The largest power of 2 not exceeding the tick worth of the
        // configured period serves as the TSC modulus from here on.
        let tsc_remainder_length = tsc_worth_of_modulus.ilog2();
        let tsc_modulus = 1u64 << tsc_remainder_length;
        let nsecs_per_tsc_modulus = (tsc_modulus * mult) >> shift;
        let tsc_remainder_bitmask = tsc_modulus - 1;

        debug!("TSC modulus: {tsc_modulus}");
        debug!("nanoseconds per TSC modulus: {nsecs_per_tsc_modulus}");
        debug!("bitmask to extract TSC remainder: {tsc_remainder_bitmask:#x}");

        Ok(Self {
            mult,
            shift,
            nsecs_per_tsc_modulus,
            tsc_remainder_length,
            tsc_remainder_bitmask,
            tsc_ticks_per_sec: tsc_per_sec,
        })
    }

    /// Convert TSC ticks to nanoseconds.
    ///
    /// Only shifts, masks, multiplications, and an addition; by the choice
    /// of the conversion factor the multiplications cannot overflow. For the
    /// conversion to stay fast the structure with the parameters must stay
    /// in cache.
    #[inline]
    pub fn convert_to_nsec(&self, ticks: Timestamp) -> u64 {
        (ticks.0 >> self.tsc_remainder_length) * self.nsecs_per_tsc_modulus
            + ((ticks.0 & self.tsc_remainder_bitmask) * self.mult >> self.shift)
    }

    /// Number of TSC ticks per second.
    pub fn tsc_ticks_per_sec(&self) -> u64 {
        self.tsc_ticks_per_sec
    }
}

fn timespec_to_nsecs(ts: &libc::timespec) -> u64 {
    ts.tv_sec as u64 * NSECS_PER_SEC + ts.tv_nsec as u64
}

/// Measure how much the TSC advances during the given period of system time,
/// scaled to ticks per second.
///
/// System time comes from CLOCK_MONOTONIC_RAW: NTP adjusts the pace of the
/// plain monotonic clock, and a slewed reference would bias the measured
/// rate.
fn calc_tsc_count_per_second(time_period_usecs: u64) -> Result<u64> {
    let clock_failed = "a call to clock_gettime() failed";

    // Time is read first and the TSC right after it, with nothing in
    // between; even the return code is examined only once the TSC value is
    // taken. The end pair below is read in the same order, so the
    // near-constant syscall latency separating the two reads cancels out.
    let mut start_ts: libc::timespec = unsafe { mem::zeroed() };
    let start_ret =
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut start_ts) };
    let start_tsc = get_tsc();

    if start_ret != 0 {
        return Err(Error::Environment(format!(
            "{clock_failed}: {}",
            io::Error::last_os_error()
        )));
    }

    let start_nsecs = timespec_to_nsecs(&start_ts);

    let (end_nsecs, end_tsc) = loop {
        let mut end_ts: libc::timespec = unsafe { mem::zeroed() };
        let end_ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut end_ts) };
        let end_tsc = get_tsc();

        if end_ret != 0 {
            return Err(Error::Environment(format!(
                "{clock_failed}: {}",
                io::Error::last_os_error()
            )));
        }

        let end_nsecs = timespec_to_nsecs(&end_ts);

        if end_nsecs - start_nsecs >= time_period_usecs * 1000 {
            break (end_nsecs, end_tsc);
        }
    };

    // Possibly a TSC wrap. No guessing here; the observed inconsistency is
    // reported as-is.
    if start_tsc.0 >= end_tsc.0 {
        return Err(Error::Inconsistency(format!(
            "end TSC value ({}) is smaller than or equal to start TSC value ({}); \
             TSC wrap might have happened",
            end_tsc.0, start_tsc.0
        )));
    }

    let tsc_delta = end_tsc.0 - start_tsc.0;

    // The difference may be huge simply because the matching period is; the
    // configured period is assumed to stay within sane bounds.
    if tsc_delta > u64::MAX / NSECS_PER_SEC {
        return Err(Error::Inconsistency(format!(
            "difference between end and start TSC values is too big ({tsc_delta})"
        )));
    }

    Ok(tsc_delta * NSECS_PER_SEC / (end_nsecs - start_nsecs))
}

/// Given a series of ticks-per-second samples, calculate a single value
/// freed from random measurement noise.
///
/// TSC and system time cannot be read at the same instant, and the gap
/// between the two reads is disturbed by syscall overhead, interrupts, and
/// context switches. Those disturbances push individual samples to both
/// sides of the true rate and are assumed to be normally distributed, so the
/// samples farther than one standard deviation from the mean are dropped and
/// the rest averaged.
fn clean_tsc_per_sec_samples(samples: &[u64]) -> Result<u64> {
    debug!("cleaning collected TSC-per-second values from random noise");

    // Incremental (Welford) formulas: the classical mean needs the raw sum
    // of all samples, which can overflow on large data sets.
    let mut mean = 0.0f64;
    let mut s = 0.0f64;

    for (i, &sample) in samples.iter().enumerate() {
        let delta = sample as f64 - mean;
        mean += delta / (i + 1) as f64;
        s += delta * (sample as f64 - mean);
    }

    // Corrected sample standard deviation: the division is by (n - 1).
    let sigma = if samples.len() > 1 {
        (s / (samples.len() - 1) as f64).sqrt()
    } else {
        s.sqrt()
    };

    let min_sample = *samples
        .iter()
        .min()
        .ok_or_else(|| Error::Environment("no TSC-per-second samples were collected".into()))?;
    let max_sample = *samples.iter().max().unwrap_or(&min_sample);

    debug!("minimum sample: {min_sample}, maximum sample: {max_sample}");
    debug!("mean: {mean}, corrected sample standard deviation: {sigma}");

    let mut num_good_samples = 0u64;
    let mut average = 0u64;

    for &sample in samples {
        if (sample as f64 - mean).abs() > sigma {
            continue;
        }

        num_good_samples += 1;

        // Samples can be big; what is summed up is their distance from the
        // minimum sample rather than the raw values, so the accumulator is
        // much harder to overflow. Still check.
        average = average.checked_add(sample - min_sample).ok_or_else(|| {
            Error::Environment("got overflow while calculating an average of good samples".into())
        })?;
    }

    if num_good_samples == 0 {
        return Err(Error::PoorStatistics(
            "every TSC-per-second sample was rejected as a statistical outlier".into(),
        ));
    }

    // Undo the shift by (num_good_samples * min_sample). No overflow: the
    // average cannot exceed the maximum sample.
    average /= num_good_samples;
    average += min_sample;

    debug!("average cleaned from statistical noise: {average}");

    Ok(average)
}

/// Calculate the number of seconds remaining before the earliest TSC wrap,
/// considering every allowed CPU.
///
/// The CPU with the largest counter value wraps first, so each allowed CPU
/// is visited and read once.
fn calc_secs_before_wrap(state: &ProcAndSysState, params: &ConversionParams) -> Result<u64> {
    info!("calculating time before the earliest TSC wrap");

    let mut max_tsc_val = 0u64;

    for &cpu_id in &state.allowed_cpus {
        pin_current_thread(cpu_id)
            .map_err(|e| e.context("couldn't change CPU affinity of the current thread"))?;

        let tsc_val = get_tsc().0;

        debug!("TSC on CPU {cpu_id}: {tsc_val}");
        max_tsc_val = max_tsc_val.max(tsc_val);
    }

    debug!("the maximum TSC value: {max_tsc_val}");

    let secs_before_wrap =
        params.convert_to_nsec(Timestamp(u64::MAX - max_tsc_val)) / NSECS_PER_SEC;

    debug!("seconds before the maximum TSC value wraps: {secs_before_wrap}");

    Ok(secs_before_wrap)
}

/// Calculate parameters needed to perform fast and accurate conversion of
/// TSC ticks to nanoseconds, and the time remaining before the earliest TSC
/// wrap.
pub(crate) fn get_tsc_to_nsec_conversion_params() -> Result<ConversionEstimate> {
    info!("calculating TSC-to-nanoseconds conversion parameters");

    let mut samples = [0u64; TSC_PER_SEC_SAMPLE_COUNT];

    debug!("measuring how the TSC changes during a second-long time period");

    for (i, sample) in samples.iter_mut().enumerate() {
        *sample = calc_tsc_count_per_second(TIME_PERIOD_TO_MATCH_WITH_TSC_USECS)
            .map_err(|e| e.context("error while calculating the TSC worth of a second"))?;

        debug!("[measurement {i}] TSC ticks per second: {sample}");
    }

    let tsc_per_sec = clean_tsc_per_sec_samples(&samples)
        .map_err(|e| e.context("error while cleaning TSC-per-second samples from random noise"))?;

    let params = ConversionParams::from_tsc_per_sec(tsc_per_sec)
        .map_err(|e| e.context("error while calculating TSC-to-nanoseconds conversion parameters"))?;

    let state = ProcAndSysState::capture()
        .map_err(|e| e.context("couldn't obtain details of the system and process state"))?;

    let secs_before_wrap = with_restored_state(&state, || {
        calc_secs_before_wrap(&state, &params)
            .map_err(|e| e.context("error while calculating time before the earliest TSC wrap"))
    })?;

    Ok(ConversionEstimate {
        params,
        secs_before_wrap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_at_two_gigahertz() {
        let params = ConversionParams::from_tsc_per_sec(2_000_000_000).unwrap();

        // 10^9 ticks at 2 GHz is 500 ms.
        let ns = params.convert_to_nsec(Timestamp(1_000_000_000));
        assert!(ns.abs_diff(500_000_000) <= 1, "got {ns}");
    }

    #[test]
    fn hour_long_conversion_error_stays_below_fifth_of_a_millisecond() {
        let rate = 3_333_333_333u64;
        let params = ConversionParams::from_tsc_per_sec(rate).unwrap();

        let ns = params.convert_to_nsec(Timestamp(rate * 3600));
        assert!(
            ns.abs_diff(3600 * 1_000_000_000) <= 200_000,
            "conversion of one hour is off by {} ns",
            ns.abs_diff(3600 * 1_000_000_000)
        );
    }

    #[test]
    fn one_second_roundtrip_is_tight() {
        for rate in [1_000_000_000u64, 2_400_000_000, 2_500_000_000, 3_800_000_000] {
            let params = ConversionParams::from_tsc_per_sec(rate).unwrap();
            let ns = params.convert_to_nsec(Timestamp(rate));

            assert!(
                ns.abs_diff(1_000_000_000) <= 1000,
                "one second at {rate} ticks/s converted to {ns} ns"
            );
        }
    }

    #[test]
    fn remainder_mask_matches_remainder_length() {
        let params = ConversionParams::from_tsc_per_sec(2_000_000_000).unwrap();
        let tsc_modulus = 1u64 << params.tsc_remainder_length;

        assert_eq!(params.tsc_remainder_bitmask, tsc_modulus - 1);
        // The modulus is the largest power of two within the tick worth of
        // the configured period.
        assert!(tsc_modulus <= TIME_CONVERSION_MODULUS_SECS * 2_000_000_000);
        assert!(tsc_modulus * 2 > TIME_CONVERSION_MODULUS_SECS * 2_000_000_000);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(ConversionParams::from_tsc_per_sec(0).is_err());
    }

    #[test]
    fn identical_samples_clean_to_themselves() {
        let samples = [2_000_000_000u64; 30];

        assert_eq!(clean_tsc_per_sec_samples(&samples).unwrap(), 2_000_000_000);
    }

    #[test]
    fn outlier_is_filtered_out() {
        let mut samples = [1000u64; 30];
        samples[17] = 2000;

        assert_eq!(clean_tsc_per_sec_samples(&samples).unwrap(), 1000);
    }

    #[test]
    fn spread_without_outliers_averages() {
        // 999 and 1001 are both within one sigma of the mean.
        let samples = [999u64, 1001, 999, 1001, 999, 1001];

        assert_eq!(clean_tsc_per_sec_samples(&samples).unwrap(), 1000);
    }
}
