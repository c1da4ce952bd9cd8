//! Demonstrates the full workflow: evaluate TSC reliability with both
//! collection methods, build conversion parameters, and time the same busy
//! loop with the system clock and with the TSC.
//!
//! Run with `cargo run --release --example measure`. Set `RUST_LOG=debug`
//! via your logger of choice to see the library's progress output.

use std::time::{Duration, Instant};

use walltick::{get_tsc, Timestamp};

const PERIOD_TO_LOOP_FOR: Duration = Duration::from_micros(2_547_291);

fn main() -> anyhow::Result<()> {
    println!("Evaluating TSC reliability (single thread jumping across CPUs)...");
    match walltick::eval_tsc_reliability_cpu_switch() {
        Ok(estimate) => {
            println!(
                "    maximum shift between CPU counters: {} ticks",
                estimate.tsc_range_length
            );
            println!("    monotonically increasing: {}", estimate.is_monotonic);
        }
        Err(e) => println!("    evaluation failed: {e}"),
    }

    println!("Evaluating TSC reliability (one racing thread per CPU)...");
    match walltick::eval_tsc_reliability_cas_ordered() {
        Ok(estimate) => {
            println!(
                "    maximum shift between CPU counters: {} ticks",
                estimate.tsc_range_length
            );
            println!("    monotonically increasing: {}", estimate.is_monotonic);
        }
        Err(e) => println!("    evaluation failed: {e}"),
    }

    println!("Calculating TSC-to-nanoseconds conversion parameters (takes a while)...");
    let estimate = walltick::get_tsc_to_nsec_conversion_params()?;

    println!(
        "    TSC ticks per second: {}",
        estimate.params.tsc_ticks_per_sec()
    );
    println!(
        "    seconds before the earliest TSC wrap: {}",
        estimate.secs_before_wrap
    );

    // Time the same interval twice. The system clock is read only at the
    // ends of the interval, so its syscall cost doesn't distort the
    // comparison.
    let start_time = Instant::now();
    let start_tsc = get_tsc();

    while start_time.elapsed() < PERIOD_TO_LOOP_FOR {}

    let end_tsc = get_tsc();
    let elapsed = start_time.elapsed();

    let tsc_nsecs = estimate
        .params
        .convert_to_nsec(Timestamp(end_tsc.0 - start_tsc.0));

    println!("Busy loop measured by the system clock: {} ns", elapsed.as_nanos());
    println!("Busy loop measured by the TSC:          {tsc_nsecs} ns");

    Ok(())
}
