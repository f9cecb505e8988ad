use std::time::Duration;

use crate::error::ConsensusError;

/// Node-level configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interval between gossip attempts.
    pub heartbeat: Duration,
    /// Timeout for sync, eager-sync and fast-forward requests.
    pub timeout: Duration,
    /// How long a join (or leave) may take before it is abandoned.
    pub join_timeout: Duration,
    /// Maximum number of events returned by one sync.
    pub sync_limit: usize,
    /// Maximum number of concurrent gossip tasks.
    pub max_pool: usize,
    /// Consecutive failed fast-forwards after which a catch-up failure is reported.
    pub fast_forward_attempts: u32,
    /// Initial delay between fast-forward attempts; doubles on each failure.
    pub fast_forward_backoff: Duration,
    /// Rebuild the hashgraph from the store on startup.
    pub bootstrap: bool,
    pub moniker: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(30),
            sync_limit: 1000,
            max_pool: 2,
            fast_forward_attempts: 5,
            fast_forward_backoff: Duration::from_millis(200),
            bootstrap: false,
            moniker: String::new(),
        }
    }
}

impl NodeConfig {
    /// Short intervals for in-process networks.
    pub fn test_config() -> Self {
        Self {
            heartbeat: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(20),
            sync_limit: 500,
            max_pool: 2,
            fast_forward_attempts: 5,
            fast_forward_backoff: Duration::from_millis(20),
            bootstrap: false,
            moniker: String::new(),
        }
    }

    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.heartbeat.is_zero() {
            return Err(ConsensusError::InvalidConfiguration(
                "heartbeat must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() || self.join_timeout.is_zero() {
            return Err(ConsensusError::InvalidConfiguration(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.sync_limit == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "sync_limit must be greater than 0".to_string(),
            ));
        }
        if self.max_pool == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "max_pool must be greater than 0".to_string(),
            ));
        }
        if self.fast_forward_attempts == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "fast_forward_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_existing(config: NodeConfig) -> Self {
        Self { config }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.config.join_timeout = join_timeout;
        self
    }

    pub fn with_sync_limit(mut self, sync_limit: usize) -> Self {
        self.config.sync_limit = sync_limit;
        self
    }

    pub fn with_max_pool(mut self, max_pool: usize) -> Self {
        self.config.max_pool = max_pool;
        self
    }

    pub fn with_fast_forward(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.fast_forward_attempts = attempts;
        self.config.fast_forward_backoff = backoff;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap = bootstrap;
        self
    }

    pub fn with_moniker(mut self, moniker: impl Into<String>) -> Self {
        self.config.moniker = moniker.into();
        self
    }

    /// Use the in-process test preset, keeping the moniker.
    pub fn test_preset(mut self) -> Self {
        let moniker = std::mem::take(&mut self.config.moniker);
        self.config = NodeConfig {
            moniker,
            ..NodeConfig::test_config()
        };
        self
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        self.config.validate()
    }

    pub fn build(self) -> Result<NodeConfig, ConsensusError> {
        self.validate()?;
        Ok(self.config)
    }

    pub fn get_config(&self) -> NodeConfig {
        self.config.clone()
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
