// Decision: Process-wide template properties come from MEDIAFLOW_PROPERTY_* variables
// Decision: Unparsable values fall back to defaults rather than failing startup

use std::collections::BTreeMap;
use std::time::Duration;

use crate::dispatch::StepWorkerConfig;

/// Prefix of environment variables collected as process-wide properties
pub const PROPERTY_ENV_PREFIX: &str = "MEDIAFLOW_PROPERTY_";

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fallback for `${name}` tokens the supplied properties do not resolve
    pub process_properties: BTreeMap<String, String>,
    /// Bound of each listener's event channel
    pub listener_capacity: usize,
    /// Concurrently executing steps per worker pool
    pub worker_concurrency: usize,
    /// Time allowed for in-flight steps on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_properties: BTreeMap::new(),
            listener_capacity: 256,
            worker_concurrency: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Create configuration from `(name, value)` pairs
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let defaults = Self::default();

        let listener_capacity = vars
            .get("MEDIAFLOW_LISTENER_CAPACITY")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.listener_capacity);

        let worker_concurrency = vars
            .get("MEDIAFLOW_WORKER_CONCURRENCY")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.worker_concurrency);

        let shutdown_timeout = vars
            .get("MEDIAFLOW_SHUTDOWN_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        let process_properties = vars
            .iter()
            .filter_map(|(name, value)| {
                let suffix = name.strip_prefix(PROPERTY_ENV_PREFIX)?;
                (!suffix.is_empty()).then(|| (property_name(suffix), value.clone()))
            })
            .collect();

        Self {
            process_properties,
            listener_capacity,
            worker_concurrency,
            shutdown_timeout,
        }
    }

    /// Add a process-wide property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.process_properties.insert(key.into(), value.into());
        self
    }

    /// Set the listener channel bound
    pub fn with_listener_capacity(mut self, capacity: usize) -> Self {
        self.listener_capacity = capacity.max(1);
        self
    }

    /// Set step worker concurrency
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Step worker pool configuration derived from this config
    pub fn step_worker_config(&self) -> StepWorkerConfig {
        StepWorkerConfig::default()
            .with_max_concurrency(self.worker_concurrency)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

/// `SERVER_URL` -> `server.url`
fn property_name(suffix: &str) -> String {
    suffix.to_lowercase().replace('_', ".")
}
