//! Error type shared by all library operations.

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the library.
///
/// The kinds are deliberately coarse. What callers mostly need to tell apart
/// is `Inconsistency` (the counters themselves violated an invariant, so
/// TSC-based measurement should probably be disabled) from `PoorStatistics`
/// (the collected data was simply not conclusive, so a retry may help).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operating system refused or failed a required service: CPU
    /// enumeration, affinity queries or updates, clock reads, memory.
    #[error("environment error: {0}")]
    Environment(String),

    /// A TSC invariant was violated: a counter decreased, an implausible
    /// cross-CPU difference was seen, or delta ranges failed to intersect.
    ///
    /// This doesn't necessarily imply that the TSCs are unreliable. A counter
    /// wrap that happened on some CPU right before or in the middle of the
    /// calculations produces the same symptoms.
    #[error("TSC inconsistency: {0}")]
    Inconsistency(String),

    /// The collected data didn't contain enough of the patterns required by
    /// the configured statistical-significance thresholds.
    #[error("poor statistics: {0}")]
    PoorStatistics(String),

    /// Probe threads could not be started, stopped, or joined cleanly.
    #[error("probe thread supervision failed: {0}")]
    Supervisor(String),

    /// The calling thread's original CPU affinity could not be restored.
    /// Results computed before the failure are discarded: returning them
    /// would hide the fact that the process is still pinned.
    #[error("process state restoration failed: {0}")]
    Restoration(String),
}

impl Error {
    /// Prefix the message with `msg`, keeping the error kind.
    pub(crate) fn context(self, msg: &str) -> Self {
        use Error::*;

        match self {
            Environment(e) => Environment(format!("{msg}: {e}")),
            Inconsistency(e) => Inconsistency(format!("{msg}: {e}")),
            PoorStatistics(e) => PoorStatistics(format!("{msg}: {e}")),
            Supervisor(e) => Supervisor(format!("{msg}: {e}")),
            Restoration(e) => Restoration(format!("{msg}: {e}")),
        }
    }
}
