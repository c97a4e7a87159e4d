//! Engine configuration
//!
//! Defaults can be overridden from the environment (`OUROBOROS_UNIT_*`) or
//! loaded from a YAML document.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::filter::TestFilter;

/// Configuration for one test run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting depth of product data sources
    pub max_cartesian_depth: usize,
    /// Maximum number of combinations a single test may expand into
    pub max_cartesian_combinations: usize,
    /// Global cap on concurrently running tests (0 = unbounded)
    pub max_parallelism: usize,
    /// Per-assembly caps on concurrently running tests
    pub assembly_limits: HashMap<String, usize>,
    /// Timeout applied to tests that do not declare their own (milliseconds)
    pub default_timeout_ms: Option<u64>,
    /// Cancel the remaining run on the first failed or timed-out test
    pub fail_fast: bool,
    /// Delay between admission checks while the system is strained
    pub strain_backoff_ms: u64,
    /// Sampling interval of the resource monitor
    pub resource_poll_interval_ms: u64,
    /// Load average per core above which the system counts as strained
    pub cpu_strain_threshold: f64,
    /// Fraction of memory in use above which the system counts as strained
    pub memory_strain_threshold: f64,
    /// Which tests to run
    pub filter: TestFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cartesian_depth: 50,
            max_cartesian_combinations: 100_000,
            max_parallelism: num_cpus::get(),
            assembly_limits: HashMap::new(),
            default_timeout_ms: None,
            fail_fast: false,
            strain_backoff_ms: 50,
            resource_poll_interval_ms: 500,
            cpu_strain_threshold: 0.9,
            memory_strain_threshold: 0.9,
            filter: TestFilter::default(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("OUROBOROS_UNIT_MAX_DEPTH")? {
            config.max_cartesian_depth = v;
        }
        if let Some(v) = env_parse::<usize>("OUROBOROS_UNIT_MAX_COMBINATIONS")? {
            config.max_cartesian_combinations = v;
        }
        if let Some(v) = env_parse::<usize>("OUROBOROS_UNIT_MAX_PARALLELISM")? {
            config.max_parallelism = v;
        }
        if let Some(v) = env_parse::<u64>("OUROBOROS_UNIT_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse::<bool>("OUROBOROS_UNIT_FAIL_FAST")? {
            config.fail_fast = v;
        }
        if let Some(v) = env_parse::<u64>("OUROBOROS_UNIT_STRAIN_BACKOFF_MS")? {
            config.strain_backoff_ms = v;
        }
        if let Ok(pattern) = std::env::var("OUROBOROS_UNIT_FILTER") {
            config.filter.name_pattern = Some(pattern);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every run fail or hang
    pub fn validate(&self) -> Result<()> {
        if self.max_cartesian_depth == 0 {
            return Err(EngineError::Configuration(
                "max_cartesian_depth must be at least 1".to_string(),
            ));
        }
        if self.max_cartesian_combinations == 0 {
            return Err(EngineError::Configuration(
                "max_cartesian_combinations must be at least 1".to_string(),
            ));
        }
        if let Some((assembly, _)) = self.assembly_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(EngineError::Configuration(format!(
                "assembly limit for '{}' must be at least 1",
                assembly
            )));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(EngineError::Configuration(
                "default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.resource_poll_interval_ms == 0 {
            return Err(EngineError::Configuration(
                "resource_poll_interval_ms must be positive".to_string(),
            ));
        }
        self.filter.compile()?;
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn strain_backoff(&self) -> Duration {
        Duration::from_millis(self.strain_backoff_ms)
    }

    pub fn resource_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resource_poll_interval_ms)
    }

    /// Builder-style override of the combination limit
    pub fn with_max_combinations(mut self, limit: usize) -> Self {
        self.max_cartesian_combinations = limit;
        self
    }

    /// Builder-style override of the global parallelism cap
    pub fn with_max_parallelism(mut self, limit: usize) -> Self {
        self.max_parallelism = limit;
        self
    }

    /// Builder-style per-assembly cap
    pub fn with_assembly_limit(mut self, assembly: impl Into<String>, limit: usize) -> Self {
        self.assembly_limits.insert(assembly.into(), limit);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_filter(mut self, filter: TestFilter) -> Self {
        self.filter = filter;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Configuration(format!("invalid value for {}: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
