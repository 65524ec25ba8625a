/*!
 * Runtime Configuration
 *
 * Shape of the simulated machine and tuning for cross-call workers
 */

use crate::core::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on CPUs per runtime context
pub const MAXCPUS: usize = 64;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of CPUs (one cross-call worker each)
    pub ncpu: usize,
    /// Backoff steps a cross-call worker spins and yields before parking
    pub xc_spin_limit: u32,
    /// Park interval while a CPU is at raised priority
    #[serde(with = "duration_micros")]
    pub xc_park_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, MAXCPUS);
        Self {
            ncpu,
            xc_spin_limit: 16,
            xc_park_interval: Duration::from_micros(50),
        }
    }
}

impl RuntimeConfig {
    /// Uniprocessor configuration
    pub fn single_cpu() -> Self {
        Self {
            ncpu: 1,
            ..Self::default()
        }
    }

    /// Configuration optimized for short read sections (workers never park
    /// for long)
    pub fn low_latency(ncpu: usize) -> Self {
        Self {
            ncpu,
            xc_spin_limit: 64,
            xc_park_interval: Duration::from_micros(5),
        }
    }

    /// Build from environment variables, falling back to defaults
    ///
    /// Environment variables:
    /// - PSZ_NCPU: number of CPUs
    /// - PSZ_XC_SPIN_LIMIT: backoff steps before a worker parks
    /// - PSZ_XC_PARK_US: park interval in microseconds
    pub fn from_env() -> RuntimeResult<Self> {
        let mut config = Self::default();

        if let Some(ncpu) = env_parse::<usize>("PSZ_NCPU")? {
            config.ncpu = ncpu;
        }
        if let Some(limit) = env_parse::<u32>("PSZ_XC_SPIN_LIMIT")? {
            config.xc_spin_limit = limit;
        }
        if let Some(us) = env_parse::<u64>("PSZ_XC_PARK_US")? {
            config.xc_park_interval = Duration::from_micros(us);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the runtime relies on
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.ncpu == 0 || self.ncpu > MAXCPUS {
            return Err(RuntimeError::InvalidCpuCount {
                requested: self.ncpu,
                max: MAXCPUS,
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> RuntimeResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RuntimeError::InvalidConfig { key, value }),
        Err(_) => Ok(None),
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}
