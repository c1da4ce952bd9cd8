//! TSC reliability evaluation based on CAS-ordered probes: concurrently
//! running threads (one per available CPU) collect TSC values that are
//! globally ordered by winning a compare-and-swap on a shared counter.
//!
//! Unlike the CPU-switching carousel, this method observes all counters
//! while they are racing each other, so the probe spacing is a few CAS round
//! trips instead of a thread migration.

use std::hint;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::{debug, info, log_enabled, trace, warn, Level};

use crate::config::{
    DELTA_RANGE_COUNT_THRESHOLD, FULL_LOOP_COUNT_THRESHOLD, MONOTONICITY_PROBES_COUNT,
    PROBE_CANCEL_BUDGET, PROBE_JOIN_POLL_PERIOD, PROBE_RUN_BUDGET, TSC_RANGE_PROBES_COUNT,
};
use crate::error::{Error, Result};
use crate::proc_state::{pin_current_thread, ProcAndSysState};
use crate::range::DeltaRange;
use crate::{get_tsc, ReliabilityEstimate};

/// A single TSC probe.
#[derive(Clone, Copy, Default, Debug)]
struct TscProbe {
    /// TSC value.
    tsc_val: u64,
    /// Position in the globally ordered sequence of probes.
    seq_num: u64,
}

/// State shared by all TSC probe threads of one collection. Born at the
/// start of the collection, dropped before it returns; nothing here outlives
/// a public call.
///
/// The two hot counters live on separate cache lines: both are hammered by
/// every probe thread, and the probe loop is exactly the place where false
/// sharing would distort the measurements being taken.
struct ProbeSharedState {
    /// Global probe sequence counter, advanced only by winning a CAS.
    seq_counter: CachePadded<AtomicU64>,
    /// Readiness barrier. Each thread increments it once after pinning
    /// itself, then spins until the target is reached, so that all threads
    /// enter the probe loop more or less simultaneously and no CPU produces
    /// a long run of probes alone.
    ready_counter: CachePadded<AtomicU32>,
    /// Set by the supervisor to make the probe threads bail out wherever
    /// they are.
    abort: AtomicBool,
    /// Number of probe threads; the target value for `ready_counter`.
    num_threads: u32,
}

/// Body of a TSC probe thread.
///
/// The probe loop must stay as tight as possible: no allocation, no locks,
/// nothing that can block. The output buffer is allocated before the
/// readiness barrier, and the abort flag is the only exit besides
/// completion.
fn probe_thread_body(
    cpu_id: usize,
    probes_count: usize,
    shared: Arc<ProbeSharedState>,
) -> Result<Vec<TscProbe>> {
    pin_current_thread(cpu_id)
        .map_err(|e| e.context("probe thread couldn't bind itself to its designated CPU"))?;

    let mut probes = vec![TscProbe::default(); probes_count];

    shared.ready_counter.fetch_add(1, Ordering::AcqRel);

    while shared.ready_counter.load(Ordering::Acquire) < shared.num_threads {
        if shared.abort.load(Ordering::Relaxed) {
            return Err(Error::Supervisor(
                "probe thread was stopped at the readiness barrier".into(),
            ));
        }

        hint::spin_loop();
    }

    for probe in probes.iter_mut() {
        let (tsc_val, seq_num) = loop {
            if shared.abort.load(Ordering::Relaxed) {
                return Err(Error::Supervisor(
                    "probe thread was stopped before collecting all probes".into(),
                ));
            }

            let seq_num = shared.seq_counter.load(Ordering::Acquire);

            // The TSC read has no data dependency on the counter, so neither
            // the compiler nor the CPU is obliged to keep it between the
            // load and the CAS; acquire-release ordering alone doesn't pin
            // it down. A full fence does.
            fence(Ordering::SeqCst);

            let tsc_val = get_tsc();

            if shared
                .seq_counter
                .compare_exchange(seq_num, seq_num + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // The recorded TSC value may pre-date the winning CAS by a
                // few cycles. That bias is accepted: re-reading the counter
                // after the CAS would widen the window instead.
                break (tsc_val.0, seq_num);
            }
        };

        *probe = TscProbe { tsc_val, seq_num };
    }

    Ok(probes)
}

/// Counters aggregated while waiting for the probe threads.
#[derive(Default)]
struct WaitTally {
    timed_out: bool,
    failed_threads: usize,
    detached: usize,
    first_failure: Option<Error>,
}

/// Poll-join the still-running threads until all of them finish or `budget`
/// elapses. Joined threads are removed from `handles`; their probe buffers
/// land in `results`. Returns true iff no thread is left running.
fn wait_with_timeout(
    handles: &mut [Option<JoinHandle<Result<Vec<TscProbe>>>>],
    results: &mut [Option<Vec<TscProbe>>],
    budget: Duration,
    tally: &mut WaitTally,
) -> bool {
    let deadline = Instant::now() + budget;

    loop {
        let mut remaining = 0;

        for (ind, slot) in handles.iter_mut().enumerate() {
            let Some(handle) = slot else { continue };

            if !handle.is_finished() {
                remaining += 1;
                continue;
            }

            match slot.take().expect("handle observed above").join() {
                Ok(Ok(probes)) => results[ind] = Some(probes),
                Ok(Err(e)) => {
                    debug!("probe thread {ind} exited with an error: {e}");
                    tally.failed_threads += 1;
                    tally.first_failure.get_or_insert(e);
                }
                Err(_) => {
                    debug!("probe thread {ind} panicked");
                    tally.failed_threads += 1;
                }
            }
        }

        if remaining == 0 {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        thread::sleep(PROBE_JOIN_POLL_PERIOD);
    }
}

/// Collect `probes_count` TSC probes on each of the given CPUs using
/// concurrently running threads (one thread per CPU), sequentially ordered
/// by means of a compare-and-swap operation.
///
/// On success the returned arrays carry, across all of them, each sequence
/// number `0..cpu_ids.len() * probes_count` exactly once. Any supervision
/// problem (a thread that couldn't start, didn't finish within the budget,
/// exited with an error, or had to be left behind detached) discards all
/// collected data; partial results are never returned.
fn collect_cas_ordered_probes(cpu_ids: &[usize], probes_count: usize) -> Result<Vec<Vec<TscProbe>>> {
    collect_probes_with_budgets(cpu_ids, probes_count, PROBE_RUN_BUDGET, PROBE_CANCEL_BUDGET)
}

fn collect_probes_with_budgets(
    cpu_ids: &[usize],
    probes_count: usize,
    run_budget: Duration,
    cancel_budget: Duration,
) -> Result<Vec<Vec<TscProbe>>> {
    let num_threads = cpu_ids.len();

    // Every probe gets a u64 sequence number, so the total count must fit.
    if probes_count as u64 > u64::MAX / num_threads as u64 {
        return Err(Error::Environment(format!(
            "the number of probes per thread must not be bigger than {} ({} requested)",
            u64::MAX / num_threads as u64,
            probes_count
        )));
    }

    let shared = Arc::new(ProbeSharedState {
        seq_counter: CachePadded::new(AtomicU64::new(0)),
        ready_counter: CachePadded::new(AtomicU32::new(0)),
        abort: AtomicBool::new(false),
        num_threads: num_threads as u32,
    });

    let mut handles: Vec<Option<JoinHandle<Result<Vec<TscProbe>>>>> =
        Vec::with_capacity(num_threads);
    let mut create_failed = 0;

    for &cpu_id in cpu_ids {
        let thread_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("tsc-probe-{cpu_id}"))
            .spawn(move || probe_thread_body(cpu_id, probes_count, thread_shared));

        match spawned {
            Ok(handle) => handles.push(Some(handle)),
            Err(e) => {
                warn!("couldn't start a TSC probe thread for CPU {cpu_id}: {e}");
                create_failed = num_threads - handles.len();

                // The already-running threads would wait at the readiness
                // barrier forever; tell them to bail out.
                shared.abort.store(true, Ordering::Release);

                break;
            }
        }
    }

    let aborted = create_failed > 0;
    let mut results: Vec<Option<Vec<TscProbe>>> = (0..handles.len()).map(|_| None).collect();
    let mut tally = WaitTally::default();
    let budget = if aborted { cancel_budget } else { run_budget };

    let mut all_joined = wait_with_timeout(&mut handles, &mut results, budget, &mut tally);

    if !all_joined && !aborted {
        // The run budget is exhausted. Stop the stragglers and give them a
        // separate, shorter window to come home.
        tally.timed_out = true;
        shared.abort.store(true, Ordering::Release);

        all_joined = wait_with_timeout(&mut handles, &mut results, cancel_budget, &mut tally);
    }

    if !all_joined {
        // Nothing more can be done about threads that survived the cancel
        // budget; dropping the handle leaves them running detached.
        tally.timed_out = true;

        for slot in handles.iter_mut() {
            if slot.take().is_some() {
                tally.detached += 1;
            }
        }
    }

    if aborted || tally.timed_out || tally.failed_threads > 0 || tally.detached > 0 {
        let summary = format!(
            "<threads that failed to start: {create_failed}>, <timeout: {}>, \
             <failed threads: {}>, <threads left detached: {}>",
            if tally.timed_out { "yes" } else { "no" },
            tally.failed_threads,
            tally.detached
        );

        return Err(match tally.first_failure {
            Some(cause) => Error::Supervisor(format!("{summary}; first thread error: {cause}")),
            None => Error::Supervisor(summary),
        });
    }

    Ok(results
        .into_iter()
        .map(|probes| probes.expect("every thread joined cleanly"))
        .collect())
}

/// Dump the merged probe sequence. CPU index may not be equal to CPU ID; the
/// mapping is logged by the caller.
fn dump_probe_sequence(tsc_probes: &[Vec<TscProbe>]) {
    if !log_enabled!(Level::Trace) {
        return;
    }

    trace!("sequence of TSC probes");

    let total: u64 = tsc_probes.iter().map(|probes| probes.len() as u64).sum();
    let mut cursors = vec![0usize; tsc_probes.len()];

    for seq_num in 0..total {
        for (cpu_ind, probes) in tsc_probes.iter().enumerate() {
            let cursor = cursors[cpu_ind];

            if cursor < probes.len() && probes[cursor].seq_num == seq_num {
                trace!("seq {seq_num}: CPU index {cpu_ind}, TSC value {}", probes[cursor].tsc_val);
                cursors[cpu_ind] += 1;

                break;
            }
        }
    }
}

/// Make sure the collected TSC values do vary on each of the CPUs.
///
/// A counter that doesn't move would pass both the delta-range and the
/// monotonicity examinations perfectly while being useless for measuring
/// time: the library requires TSC values to grow on a global scale and not
/// decrease locally, so runs of equal values are otherwise acceptable.
fn check_probes_consistency(tsc_probes: &[&[TscProbe]]) -> Result<()> {
    for (cpu_ind, probes) in tsc_probes.iter().enumerate() {
        if probes.first().map(|p| p.tsc_val) == probes.last().map(|p| p.tsc_val) {
            return Err(Error::Inconsistency(format!(
                "first and last TSC probes collected on a CPU with index {cpu_ind} \
                 have equal TSC values"
            )));
        }
    }

    Ok(())
}

/// Calculate bounds of the shift between TSC on a given CPU and TSC on the
/// base CPU from one globally ordered sequence of CAS-ordered probes.
///
/// Take two probes collected successively on the base CPU, with TSC values
/// `t1` and `t2`, that enclose at least one probe of the other CPU in the
/// global order; let `T1` and `T2` be the TSC values of the first and last
/// enclosed probes. For any enclosed reading `T`, the base counter held some
/// `t` in `[t1, t2]` at the same instant. Assuming time runs at the same
/// pace on both CPUs, `t` can be no closer to `t2` than `T2 - T`, so
/// `delta = T - t >= T2 - t2`; symmetrically `t` can be no closer to `t1`
/// than `T - T1`, so `delta <= T1 - t1`. Every enclosed sub-sequence thus
/// yields one interval `[T2 - t2, T1 - t1]` for the shift, and all the
/// intervals extracted from the sequence must mutually intersect; their
/// intersection is the final estimate.
///
/// `base` is the probe array of the base CPU, `other` the array of the other
/// CPU from the same collection.
fn calc_tsc_delta_range_cas(base: &[TscProbe], other: &[TscProbe]) -> Result<DeltaRange> {
    debug!("calculating shift between TSC counters of the two CPUs");

    check_probes_consistency(&[base, other])?;

    // Successive TSC values measured on the same CPU must not decrease
    // (unless the counter wraps).
    for probes in [base, other] {
        if probes.windows(2).any(|w| w[1].tsc_val < w[0].tsc_val) {
            return Err(Error::Inconsistency(
                "detected decreasing successive TSC values (measured on the same CPU); \
                 may be a result of TSC wrap"
                    .into(),
            ));
        }
    }

    let mut range = DeltaRange::FULL;
    let mut num_ranges = 0u64;
    let mut ig = 0usize;

    for ib in 1..base.len() {
        let prev = base[ib - 1];
        let curr = base[ib];

        // Only base pairs with at least one probe in between are usable.
        if curr.seq_num == prev.seq_num + 1 {
            continue;
        }

        while ig < other.len() && other[ig].seq_num < prev.seq_num {
            ig += 1;
        }

        let sub_seq_first = ig;

        while ig < other.len() && other[ig].seq_num < curr.seq_num {
            ig += 1;
        }

        if ig == sub_seq_first {
            continue;
        }

        let tsc_given_min = other[sub_seq_first].tsc_val;
        let tsc_given_max = other[ig - 1].tsc_val;

        num_ranges += 1;

        // A cross-CPU difference that doesn't fit i64 cannot be a plausible
        // shift. The per-CPU monotonicity check above only rules out a wrap
        // DURING the collection; one CPU may have wrapped right before it
        // while another is still approaching its wrap point, and then the
        // two counters sit on opposite sides of the wrap for the whole run.
        if u64::abs_diff(tsc_given_min, prev.tsc_val) > i64::MAX as u64
            || u64::abs_diff(tsc_given_max, curr.tsc_val) > i64::MAX as u64
        {
            return Err(Error::Inconsistency(format!(
                "difference between TSC values measured on different CPUs is bigger than {}; \
                 may be a result of TSC wrap",
                i64::MAX
            )));
        }

        // The elapsed ticks between the enclosing base probes must cover the
        // elapsed ticks between the probes they enclose.
        if curr.tsc_val - prev.tsc_val < tsc_given_max - tsc_given_min {
            return Err(Error::Inconsistency(
                "TSC interval between enclosing probes collected on the base CPU is shorter \
                 than the interval between the probes they enclose; time appears to run at a \
                 different pace on the two CPUs"
                    .into(),
            ));
        }

        let bound = DeltaRange {
            lo: tsc_given_max.wrapping_sub(curr.tsc_val) as i64,
            hi: tsc_given_min.wrapping_sub(prev.tsc_val) as i64,
        };

        range = range.intersect(bound).ok_or_else(|| {
            Error::Inconsistency(
                "TSC delta ranges calculated for different sub-sequences don't intersect".into(),
            )
        })?;

        trace!(
            "the shift belongs to range: {} [{}, {}]",
            bound.len(),
            bound.lo,
            bound.hi
        );
    }

    if num_ranges < DELTA_RANGE_COUNT_THRESHOLD {
        return Err(Error::PoorStatistics(format!(
            "couldn't observe the required amount of TSC probe sub-sequences with desired \
             properties ({DELTA_RANGE_COUNT_THRESHOLD} required, {num_ranges} found)"
        )));
    }

    debug!(
        "combined range (intersection of all the above): {} [{}, {}]",
        range.len(),
        range.lo,
        range.hi
    );

    Ok(range)
}

/// Calculate the size of the enclosing TSC range from CAS-ordered probes: a
/// non-negative value such that if TSC values were measured simultaneously
/// on all available CPUs, the difference between the largest and the
/// smallest would not exceed it.
fn calc_tsc_enclosing_range_cas(state: &ProcAndSysState) -> Result<i64> {
    let base_cpu = state.initial_cpu;
    let mut enclosing: Option<DeltaRange> = None;

    info!("calculating an upper bound for shifts between TSC counters running on different CPUs");
    debug!("base CPU ID: {base_cpu}");

    for &cpu_id in state.allowed_cpus.iter().filter(|&&c| c != base_cpu) {
        debug!("collecting TSC probes on CPUs {base_cpu} and {cpu_id}");

        let probes = collect_cas_ordered_probes(&[base_cpu, cpu_id], TSC_RANGE_PROBES_COUNT)
            .map_err(|e| e.context("error while collecting CAS-ordered TSC probes"))?;

        debug!("CPU ID {base_cpu} maps to CPU index 0");
        debug!("CPU ID {cpu_id} maps to CPU index 1");
        dump_probe_sequence(&probes);

        let range = calc_tsc_delta_range_cas(&probes[0], &probes[1])
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

/// Verdict of scanning a globally ordered probe sequence.
#[derive(Debug, PartialEq, Eq)]
enum SequenceVerdict {
    /// TSC values never decreased along the sequence; `full_loops` counts
    /// the disjoint full loops found along the way.
    Monotonic { full_loops: u64 },
    /// TSC values decreased at this position of the global sequence.
    BrokenAt { seq_num: u64 },
}

/// Walk the probes in order of increasing sequence numbers and examine
/// whether TSC values increase as well.
///
/// Along the scan the function assesses the statistical weight of a positive
/// answer by counting "full loops". Treating the sequence of probes as a
/// path over the available CPUs, a full loop is a sub-sequence of successive
/// probes that starts and ends on the same CPU and visits every available
/// CPU at least once in between, with no shorter such sub-sequence starting
/// at the same point. A path on which all CPUs were visited but no full loop
/// closed proves nothing about the relative order of the counters; every
/// closed loop adds independent evidence.
///
/// Two simplifications keep the algorithm linear: overlapping loops are not
/// counted, and every loop is required to start on the first CPU of the
/// sequence. With 4 CPUs and the path 3 2 1 3 4 2 no loop starting on CPU 3
/// exists and none is counted, although the path does contain a loop
/// starting on CPU 2. Dropping the constraint would raise the complexity
/// from O(probes) with O(CPUs) extra memory to O(probes * CPUs) with
/// O(CPUs^2), and the simple version has proven precise enough.
///
/// The bookkeeping: `cpu_seen_round[ind] == num_loops + 1` means CPU `ind`
/// was already seen while looking for the current loop. Counters are
/// compared against the loop number instead of being cleared every time a
/// loop closes.
fn scan_probe_sequence(tsc_probes: &[Vec<TscProbe>]) -> Result<SequenceVerdict> {
    debug!("testing monotonicity of the TSC probe sequence");

    let series: Vec<&[TscProbe]> = tsc_probes.iter().map(Vec::as_slice).collect();
    check_probes_consistency(&series)?;

    let num_cpus = tsc_probes.len();
    let total: u64 = tsc_probes.iter().map(|probes| probes.len() as u64).sum();

    let first_cpu_ind = tsc_probes
        .iter()
        .position(|probes| probes.first().is_some_and(|p| p.seq_num == 0))
        .ok_or_else(|| {
            Error::Inconsistency("no collected probe carries sequence number zero".into())
        })?;

    let mut cursors = vec![0usize; num_cpus];
    let mut cpu_seen_round = vec![0u64; num_cpus];
    let mut cpus_seen = 0usize;
    let mut num_loops = 0u64;
    let mut prev_tsc_val = 0u64;

    for seq_num in 0..total {
        let mut cpu_ind = 0;

        loop {
            if cpu_ind == num_cpus {
                return Err(Error::Inconsistency(format!(
                    "couldn't find a TSC probe with sequence number {seq_num}"
                )));
            }

            let cursor = cursors[cpu_ind];

            if cursor < tsc_probes[cpu_ind].len() && tsc_probes[cpu_ind][cursor].seq_num == seq_num
            {
                break;
            }

            cpu_ind += 1;
        }

        let probe = tsc_probes[cpu_ind][cursors[cpu_ind]];

        if probe.tsc_val < prev_tsc_val {
            debug!("TSC value growth breaks at sequence number {seq_num}");

            return Ok(SequenceVerdict::BrokenAt { seq_num });
        }

        cursors[cpu_ind] += 1;
        prev_tsc_val = probe.tsc_val;

        // Did this probe close a full loop?
        if cpus_seen == num_cpus && cpu_ind == first_cpu_ind {
            num_loops += 1;
            cpus_seen = 0;
        }

        // First sighting of this CPU while looking for the current loop?
        if cpu_seen_round[cpu_ind] < num_loops + 1 {
            cpu_seen_round[cpu_ind] += 1;
            cpus_seen += 1;
        }
    }

    Ok(SequenceVerdict::Monotonic {
        full_loops: num_loops,
    })
}

/// Check whether TSC values measured on same/different CPUs one after
/// another monotonically increase, using CAS-ordered probes collected on all
/// available CPUs, and assess statistical significance of the result.
///
/// A negative answer doesn't necessarily imply that the TSCs are unreliable;
/// the observed decrease may be a result of TSC wrap.
fn eval_tsc_monotonicity_cas(state: &ProcAndSysState) -> Result<bool> {
    info!("evaluating TSC monotonicity");

    for (cpu_ind, &cpu_id) in state.allowed_cpus.iter().enumerate() {
        debug!("CPU ID {cpu_id} maps to CPU index {cpu_ind}");
    }

    let probes = collect_cas_ordered_probes(&state.allowed_cpus, MONOTONICITY_PROBES_COUNT)
        .map_err(|e| e.context("error while collecting CAS-ordered TSC probes"))?;

    dump_probe_sequence(&probes);

    let verdict = scan_probe_sequence(&probes)
        .map_err(|e| e.context("error while testing monotonicity of the TSC probe sequence"))?;

    match verdict {
        SequenceVerdict::Monotonic { full_loops } if full_loops < FULL_LOOP_COUNT_THRESHOLD => {
            Err(Error::PoorStatistics(format!(
                "couldn't observe the required amount of full loops in the probe sequence \
                 ({FULL_LOOP_COUNT_THRESHOLD} required, {full_loops} found)"
            )))
        }
        SequenceVerdict::Monotonic { .. } => {
            debug!("the collected TSC values DO monotonically increase");

            Ok(true)
        }
        SequenceVerdict::BrokenAt { seq_num } => {
            // Reported regardless of the loop count: a decrease was observed
            // for sure. It may still be the result of a TSC wrap.
            debug!("TSC values decrease at sequence number {seq_num}; may be a result of TSC wrap");

            Ok(false)
        }
    }
}

/// Evaluate TSC reliability with the data collected by the method of
/// CAS-ordered probes.
pub(crate) fn eval_tsc_reliability_cas_ordered() -> Result<ReliabilityEstimate> {
    info!("evaluating TSC reliability (data collected using the method of CAS-ordered probes)");

    let state = ProcAndSysState::capture()
        .map_err(|e| e.context("couldn't obtain details of the system and process state"))?;

    // With a single allowed CPU there is nothing to race against; no probe
    // threads are created at all.
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

    let tsc_range_length = calc_tsc_enclosing_range_cas(&state)
        .map_err(|e| e.context("error while calculating enclosing TSC range"))?;
    let is_monotonic = eval_tsc_monotonicity_cas(&state)
        .map_err(|e| e.context("error while evaluating TSC monotonicity"))?;

    Ok(ReliabilityEstimate {
        tsc_range_length,
        is_monotonic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(tsc_val: u64, seq_num: u64) -> TscProbe {
        TscProbe { tsc_val, seq_num }
    }

    // Two perfectly alternating streams: base probes at even sequence
    // numbers, other-CPU probes at odd ones, every probe 10 ticks after the
    // previous, the other CPU shifted by `skew`.
    fn alternating_streams(pairs: usize, skew: u64) -> (Vec<TscProbe>, Vec<TscProbe>) {
        let base: Vec<TscProbe> = (0..=pairs as u64)
            .map(|i| probe(20 * i, 2 * i))
            .collect();
        let other: Vec<TscProbe> = (0..pairs as u64)
            .map(|i| probe(20 * i + 10 + skew, 2 * i + 1))
            .collect();

        (base, other)
    }

    #[test]
    fn delta_range_brackets_a_fixed_skew() {
        let (base, other) = alternating_streams(50, 100_000);
        let range = calc_tsc_delta_range_cas(&base, &other).unwrap();

        assert!(range.lo <= 100_000 && 100_000 <= range.hi);
        assert!(range.len() <= 20);
    }

    #[test]
    fn pair_count_below_threshold_is_poor_statistics() {
        let pairs = DELTA_RANGE_COUNT_THRESHOLD as usize - 1;
        let (base, other) = alternating_streams(pairs, 0);

        let err = calc_tsc_delta_range_cas(&base, &other).unwrap_err();
        assert!(matches!(err, Error::PoorStatistics(_)));
    }

    #[test]
    fn pair_count_at_threshold_succeeds() {
        let pairs = DELTA_RANGE_COUNT_THRESHOLD as usize;
        let (base, other) = alternating_streams(pairs, 0);

        assert!(calc_tsc_delta_range_cas(&base, &other).is_ok());
    }

    #[test]
    fn faster_enclosed_interval_is_inconsistent() {
        // The base CPU advances 10 ticks between its probes while the two
        // enclosed probes of the other CPU are 120 ticks apart.
        let base = vec![probe(0, 0), probe(10, 3), probe(40, 4), probe(60, 5)];
        let other = vec![probe(100, 1), probe(220, 2)];

        let err = calc_tsc_delta_range_cas(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn constant_counter_is_inconsistent() {
        let (base, mut other) = alternating_streams(20, 0);

        for p in other.iter_mut() {
            p.tsc_val = 7;
        }

        let err = calc_tsc_delta_range_cas(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn decreasing_counter_is_inconsistent() {
        let (mut base, other) = alternating_streams(20, 0);
        base[10].tsc_val = base[9].tsc_val - 1;

        let err = calc_tsc_delta_range_cas(&base, &other).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn scan_finds_expected_full_loops() {
        // Path A B A B A: the first A opens a loop, every later A both
        // closes one and opens the next.
        let cpu_a = vec![probe(0, 0), probe(20, 2), probe(40, 4)];
        let cpu_b = vec![probe(10, 1), probe(30, 3)];

        let verdict = scan_probe_sequence(&[cpu_a, cpu_b]).unwrap();
        assert_eq!(verdict, SequenceVerdict::Monotonic { full_loops: 2 });
    }

    #[test]
    fn only_loops_starting_on_the_first_cpu_are_counted() {
        // Path B A B A: one loop starting on B closes at the third probe;
        // the overlapping A B A loop is not counted on top of it.
        let cpu_a = vec![probe(10, 1), probe(30, 3)];
        let cpu_b = vec![probe(0, 0), probe(20, 2)];

        let verdict = scan_probe_sequence(&[cpu_a, cpu_b]).unwrap();
        assert_eq!(verdict, SequenceVerdict::Monotonic { full_loops: 1 });
    }

    #[test]
    fn scan_reports_the_violating_sequence_number() {
        let cpu_a = vec![probe(0, 0), probe(20, 2), probe(40, 4)];
        let cpu_b = vec![probe(10, 1), probe(19, 3)];

        let verdict = scan_probe_sequence(&[cpu_a, cpu_b]).unwrap();
        assert_eq!(verdict, SequenceVerdict::BrokenAt { seq_num: 3 });
    }

    #[test]
    fn equal_successive_values_stay_monotonic() {
        // The walk reads 0 10 10 30 40: values may repeat, they must not
        // decrease.
        let cpu_a = vec![probe(0, 0), probe(10, 2), probe(40, 4)];
        let cpu_b = vec![probe(10, 1), probe(30, 3)];

        let verdict = scan_probe_sequence(&[cpu_a, cpu_b]).unwrap();
        assert!(matches!(verdict, SequenceVerdict::Monotonic { .. }));
    }

    #[test]
    fn missing_sequence_number_is_detected() {
        let cpu_a = vec![probe(0, 0), probe(20, 2)];
        let cpu_b = vec![probe(10, 5), probe(30, 6)];

        let err = scan_probe_sequence(&[cpu_a, cpu_b]).unwrap_err();
        assert!(matches!(err, Error::Inconsistency(_)));
    }

    #[test]
    fn collection_produces_a_dense_global_sequence() {
        // Both workers share the current CPU; they timeshare through the
        // barrier and the CAS loop, which doesn't affect the contract.
        let cpu_id = unsafe { libc::sched_getcpu() };
        assert!(cpu_id >= 0);

        let cpu_ids = [cpu_id as usize, cpu_id as usize];
        let probes = collect_cas_ordered_probes(&cpu_ids, 200).unwrap();

        let mut seen = vec![false; 400];

        for array in &probes {
            assert_eq!(array.len(), 200);

            for w in array.windows(2) {
                assert!(w[1].seq_num > w[0].seq_num, "seq must strictly increase");
                assert!(w[1].tsc_val >= w[0].tsc_val, "tsc must not decrease");
            }

            for p in array {
                assert!(!seen[p.seq_num as usize], "duplicate seq {}", p.seq_num);
                seen[p.seq_num as usize] = true;
            }
        }

        assert!(seen.iter().all(|&s| s), "sequence numbers must be dense");
    }

    #[test]
    fn exhausted_run_budget_discards_all_results() {
        // A probe count that cannot possibly finish within a zero budget;
        // the workers run on the current CPU, whatever it is.
        let cpu_id = unsafe { libc::sched_getcpu() };
        assert!(cpu_id >= 0);

        let cpu_ids = [cpu_id as usize, cpu_id as usize];
        let err = collect_probes_with_budgets(
            &cpu_ids,
            5_000_000,
            Duration::ZERO,
            Duration::from_secs(5),
        )
        .unwrap_err();

        match err {
            Error::Supervisor(msg) => assert!(msg.contains("timeout: yes"), "{msg}"),
            other => panic!("expected a supervisor error, got: {other}"),
        }
    }
}
