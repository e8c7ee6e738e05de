//! Centralized Configuration Management
//!
//! Executor, correlator and whole-stack configuration. Every structure is
//! serde-serializable so a stack layout can be loaded from JSON.

use crate::{StackError, StackResult};
use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ----------------------------------------------------------------------------
// Executor Configuration
// ----------------------------------------------------------------------------

/// Where an executor's thread should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoreAffinity {
    /// Let the OS scheduler decide
    #[default]
    Any,
    /// Pin to a specific core
    Core(usize),
}

impl fmt::Display for CoreAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreAffinity::Any => write!(f, "any"),
            CoreAffinity::Core(core) => write!(f, "core{}", core),
        }
    }
}

/// Configuration for a single task executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor name, also used as the OS thread name
    pub name: String,
    /// Scheduling priority hint (higher runs first on platforms that honour it)
    pub priority: u8,
    /// Core affinity hint
    pub affinity: CoreAffinity,
    /// Mailbox capacity in messages
    pub queue_capacity: usize,
}

impl ExecutorConfig {
    /// Create a configuration with the given name and capacity
    pub fn new<N: Into<String>>(name: N, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            priority: 10,
            affinity: CoreAffinity::Any,
            queue_capacity,
        }
    }

    /// Set the priority hint
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the affinity hint
    pub fn with_affinity(mut self, affinity: CoreAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// HCI transport domain
    pub fn hci() -> Self {
        Self::new("hci", 60)
            .with_priority(22)
            .with_affinity(CoreAffinity::Core(0))
    }

    /// Upper protocol dispatcher domain
    pub fn btu() -> Self {
        Self::new("btu", 60)
            .with_priority(20)
            .with_affinity(CoreAffinity::Core(0))
    }

    /// Per-profile control domain
    pub fn btc() -> Self {
        Self::new("btc", 60).with_priority(19)
    }

    /// Client model domain
    pub fn client() -> Self {
        Self::new("client", 40).with_priority(18)
    }

    /// Validate the configuration
    pub fn validate(&self) -> StackResult<()> {
        if self.name.trim().is_empty() {
            return Err(StackError::config_error("executor name must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(StackError::config_error(format!(
                "executor '{}' must have a non-zero queue capacity",
                self.name
            )));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Correlator Configuration
// ----------------------------------------------------------------------------

/// Configuration for request/response correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Timeout applied when a request does not specify one
    pub default_timeout: Duration,
    /// Maximum number of simultaneously outstanding requests
    pub max_outstanding: usize,
    /// Reject a new request while another one to the same context is pending
    pub one_outstanding_per_context: bool,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(4000),
            max_outstanding: 64,
            one_outstanding_per_context: false,
        }
    }
}

impl CorrelatorConfig {
    /// Strict per-peer serialization: at most one request in flight per context
    pub fn serialized() -> Self {
        Self {
            one_outstanding_per_context: true,
            ..Self::default()
        }
    }

    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            default_timeout: Duration::from_millis(200),
            max_outstanding: 16,
            one_outstanding_per_context: false,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> StackResult<()> {
        if self.default_timeout.is_zero() {
            return Err(StackError::config_error("default_timeout must be non-zero"));
        }
        if self.max_outstanding == 0 {
            return Err(StackError::config_error("max_outstanding must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Stack Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration: the executors to create and correlator policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    pub executors: Vec<ExecutorConfig>,
    pub correlator: CorrelatorConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            executors: vec![
                ExecutorConfig::hci(),
                ExecutorConfig::btu(),
                ExecutorConfig::btc(),
                ExecutorConfig::client(),
            ],
            correlator: CorrelatorConfig::default(),
        }
    }
}

impl StackConfig {
    /// Smaller mailboxes for constrained targets
    pub fn low_memory() -> Self {
        let mut config = Self::default();
        for executor in &mut config.executors {
            executor.queue_capacity = executor.queue_capacity.min(20);
        }
        config.correlator.max_outstanding = 16;
        config
    }

    /// Configuration for tests
    pub fn testing() -> Self {
        Self {
            executors: vec![
                ExecutorConfig::new("btc", 16),
                ExecutorConfig::new("client", 16),
            ],
            correlator: CorrelatorConfig::testing(),
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> StackResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StackError::config_error(format!("invalid stack configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up an executor configuration by name
    pub fn executor(&self, name: &str) -> Option<&ExecutorConfig> {
        self.executors.iter().find(|e| e.name == name)
    }

    /// Validate every section and check executor names are unique
    pub fn validate(&self) -> StackResult<()> {
        let mut names = HashSet::new();
        for executor in &self.executors {
            executor.validate()?;
            if !names.insert(executor.name.as_str()) {
                return Err(StackError::config_error(format!(
                    "duplicate executor name '{}'",
                    executor.name
                )));
            }
        }
        self.correlator.validate()
    }
}
