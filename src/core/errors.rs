/*!
 * Error Types
 * Boot and configuration errors with thiserror and miette support
 *
 * Invariant violations in the synchronization layer are panics, not errors;
 * only conditions a caller can act on (bad configuration, bring-up failures)
 * are reported through these types.
 */

use miette::Diagnostic;
use thiserror::Error;

/// Result alias for runtime bring-up operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime bring-up errors
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    #[error("Invalid CPU count {requested} (supported: 1..={max})")]
    #[diagnostic(
        code(runtime::invalid_cpu_count),
        help("Set PSZ_NCPU or RuntimeConfig::ncpu to a value within the supported range.")
    )]
    InvalidCpuCount { requested: usize, max: usize },

    #[error("CPU {cpu} out of range (ncpu = {ncpu})")]
    #[diagnostic(
        code(runtime::cpu_out_of_range),
        help("CPU ids are dense, starting at 0.")
    )]
    CpuOutOfRange { cpu: usize, ncpu: usize },

    #[error("Secondary CPUs are already online")]
    #[diagnostic(
        code(runtime::already_online),
        help("start_mp() brings CPUs online once per runtime context.")
    )]
    AlreadyOnline,

    #[error("Invalid configuration value for {key}: {value:?}")]
    #[diagnostic(
        code(runtime::invalid_config),
        help("Check the PSZ_* environment variables.")
    )]
    InvalidConfig { key: &'static str, value: String },

    #[error("Failed to spawn cross-call worker: {0}")]
    #[diagnostic(
        code(runtime::worker_spawn),
        help("The host refused to create a thread. Check process limits.")
    )]
    WorkerSpawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RuntimeError::InvalidCpuCount {
            requested: 0,
            max: 64,
        };
        assert_eq!(err.to_string(), "Invalid CPU count 0 (supported: 1..=64)");

        let err = RuntimeError::CpuOutOfRange { cpu: 9, ncpu: 4 };
        assert_eq!(err.to_string(), "CPU 9 out of range (ncpu = 4)");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "no threads");
        let err: RuntimeError = io.into();
        assert!(matches!(err, RuntimeError::WorkerSpawn(_)));
        assert!(err.to_string().contains("no threads"));
    }
}
