//! Capture and restoration of process and system state.
//!
//! Every operation that migrates the calling thread across CPUs saves the
//! thread's state first and recovers it on the way out, on success and
//! failure paths alike.

use std::io;
use std::mem;

use crossbeam_utils::CachePadded;
use log::{debug, warn};

use crate::error::{Error, Result};

/// Values of selected parameters that describe hardware, operating system,
/// and process state.
pub(crate) struct ProcAndSysState {
    /// Number of configured logical CPUs in the system (not all of them may
    /// be available at the moment; some may be offline).
    pub num_cpus: usize,
    /// CPU the current thread was executing on when the library was entered.
    pub initial_cpu: usize,
    /// CPU set the current thread was confined to when the library was
    /// entered.
    pub initial_cpu_set: libc::cpu_set_t,
    /// IDs of the CPUs allowed by `initial_cpu_set`, in ascending order.
    /// TSC values are tested only on these CPUs.
    pub allowed_cpus: Vec<usize>,
    /// Cache line size.
    pub cline_size: usize,
}

impl ProcAndSysState {
    /// Get the cache line size using `sysconf`.
    ///
    /// The library is expected to run on a system with homogeneous CPUs (or
    /// a single CPU); the line size of the first level data cache is treated
    /// as valid for the whole machine.
    fn cache_line_size() -> Result<usize> {
        let size = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };

        if size <= 0 {
            return Err(Error::Environment(
                "sysconf() couldn't report the L1 data cache line size".into(),
            ));
        }

        Ok(size as usize)
    }

    /// Capture the current state.
    pub fn capture() -> Result<Self> {
        // `libc::get_nprocs_conf()` and `libc::_SC_NPROCESSORS_CONF` aren't
        // bound by the `libc` crate on this target; 83 is glibc's stable
        // `_SC_NPROCESSORS_CONF` sysconf parameter, which is what
        // `get_nprocs_conf()` itself queries.
        const SC_NPROCESSORS_CONF: libc::c_int = 83;
        let num_cpus = unsafe { libc::sysconf(SC_NPROCESSORS_CONF) };

        if num_cpus <= 0 {
            return Err(Error::Environment(
                "couldn't get the number of configured CPUs".into(),
            ));
        }

        let initial_cpu = unsafe { libc::sched_getcpu() };

        if initial_cpu < 0 {
            return Err(Error::Environment(
                "couldn't get ID of the current CPU".into(),
            ));
        }

        let mut initial_cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };
        let ret = unsafe {
            libc::pthread_getaffinity_np(
                libc::pthread_self(),
                mem::size_of::<libc::cpu_set_t>(),
                &mut initial_cpu_set,
            )
        };

        if ret != 0 {
            return Err(Error::Environment(format!(
                "couldn't get CPU affinity of the current thread: {}",
                io::Error::from_raw_os_error(ret)
            )));
        }

        let cline_size =
            Self::cache_line_size().map_err(|e| e.context("error while obtaining cache line size"))?;

        // Shared mutable probe state is kept apart with statically padded
        // slots; a machine with wider cache lines would make that padding
        // insufficient.
        if cline_size > mem::align_of::<CachePadded<u64>>() {
            return Err(Error::Environment(format!(
                "cache line size of {cline_size} bytes exceeds the supported padding of {} bytes",
                mem::align_of::<CachePadded<u64>>()
            )));
        }

        let allowed_cpus: Vec<usize> = (0..num_cpus as usize)
            .filter(|&cpu_id| unsafe { libc::CPU_ISSET(cpu_id, &initial_cpu_set) })
            .collect();

        if allowed_cpus.is_empty() {
            return Err(Error::Environment(
                "the affinity mask of the current thread allows no CPUs".into(),
            ));
        }

        let state = Self {
            num_cpus: num_cpus as usize,
            initial_cpu: initial_cpu as usize,
            initial_cpu_set,
            allowed_cpus,
            cline_size,
        };

        debug!(
            "{} configured CPUs, {} of them allowed for the current thread; \
             initial CPU: {}, cache line size: {}",
            state.num_cpus,
            state.allowed_cpus.len(),
            state.initial_cpu,
            state.cline_size
        );

        Ok(state)
    }

    /// Restore the initial state of the current thread.
    ///
    /// Restoration happens in two steps: the thread is first moved to the
    /// initial CPU alone and only then confined to the initial CPU set. The
    /// second step by itself could leave the thread on any CPU of the set,
    /// while the application may keep warm data in the cache of the CPU it
    /// called the library from. The first step doesn't guarantee the thread
    /// stays on the initial CPU after the second one, but it makes it very
    /// likely.
    pub fn restore(&self) -> Result<()> {
        pin_current_thread(self.initial_cpu).map_err(|e| {
            Error::Restoration(format!(
                "couldn't return the current thread to its initial CPU: {e}"
            ))
        })?;

        let ret = unsafe {
            libc::pthread_setaffinity_np(
                libc::pthread_self(),
                mem::size_of::<libc::cpu_set_t>(),
                &self.initial_cpu_set,
            )
        };

        if ret != 0 {
            return Err(Error::Restoration(format!(
                "couldn't restore CPU affinity of the current thread: {}",
                io::Error::from_raw_os_error(ret)
            )));
        }

        Ok(())
    }
}

/// Confine the current thread to a single CPU.
pub(crate) fn pin_current_thread(cpu_id: usize) -> Result<()> {
    let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };

    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(cpu_id, &mut cpu_set);
    }

    let ret = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            mem::size_of::<libc::cpu_set_t>(),
            &cpu_set,
        )
    };

    if ret != 0 {
        return Err(Error::Environment(format!(
            "couldn't move the current thread to CPU {cpu_id}: {}",
            io::Error::from_raw_os_error(ret)
        )));
    }

    Ok(())
}

/// Run `op`, then restore the captured state whatever the outcome.
///
/// A restoration failure discards an otherwise successful result. When both
/// the operation and the restoration fail, the operation error is returned
/// as the more informative one and the restoration failure is logged.
pub(crate) fn with_restored_state<T>(
    state: &ProcAndSysState,
    op: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let result = op();

    match state.restore() {
        Ok(()) => result,
        Err(restore_err) => match result {
            Ok(_) => Err(restore_err),
            Err(op_err) => {
                warn!("{restore_err}");
                Err(op_err)
            }
        },
    }
}
