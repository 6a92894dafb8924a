//! Worker pool configuration
//!
//! [`PoolConfig`] derives [`clap::Args`] so a host binary can flatten it into
//! its own command line; library users build it with the setters below.

use crate::error::{Error, Result};
use clap::Args;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on `capacity`
pub const MAX_CAPACITY: usize = 10_000;

/// Upper bound on `max_blocked`
pub const MAX_BLOCKED: i64 = 1_000;

/// Smallest accepted idle-collection interval in milliseconds
pub const MIN_GC_INTERVAL_MS: i64 = 100;

/// Order in which free workers are reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PoolType {
    /// Most recently released worker first (keeps the working set small)
    #[default]
    Stack,
    /// Least recently released worker first (spreads work evenly)
    Queue,
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stack => write!(f, "stack"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

impl FromStr for PoolType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stack" => Ok(Self::Stack),
            "queue" => Ok(Self::Queue),
            _ => Err(Error::InvalidConfig(
                "Invalid pool type, only \"stack\" or \"queue\" supported".to_string(),
            )),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PoolConfig {
    /// Free worker reuse order
    #[arg(long, value_enum, default_value = "stack")]
    pub pool_type: PoolType,

    /// Maximum number of live workers (1-10000)
    #[arg(long, default_value = "10")]
    pub capacity: usize,

    /// Spawn every worker up front instead of on demand
    #[arg(long)]
    pub pre_spawn: bool,

    /// Maximum callers blocked waiting for a worker (<= 0 fails fast)
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    pub max_blocked: i64,

    /// Idle worker collection interval in milliseconds (-1 disables)
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    pub gc_interval_ms: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_type: PoolType::Stack,
            capacity: 10,
            pre_spawn: false,
            max_blocked: -1,
            gc_interval_ms: -1,
        }
    }
}

impl PoolConfig {
    /// Default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the free worker reuse order
    #[must_use]
    pub fn with_pool_type(mut self, pool_type: PoolType) -> Self {
        self.pool_type = pool_type;
        self
    }

    /// Set the maximum number of live workers
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Spawn every worker when the pool is created
    #[must_use]
    pub fn with_pre_spawn(mut self, pre_spawn: bool) -> Self {
        self.pre_spawn = pre_spawn;
        self
    }

    /// Set how many callers may block waiting for a worker
    #[must_use]
    pub fn with_max_blocked(mut self, max_blocked: i64) -> Self {
        self.max_blocked = max_blocked;
        self
    }

    /// Collect workers idle for longer than `gc_interval_ms`, checked at
    /// the same interval; -1 disables collection
    #[must_use]
    pub fn with_gc_interval_ms(mut self, gc_interval_ms: i64) -> Self {
        self.gc_interval_ms = gc_interval_ms;
        self
    }

    /// Collection interval, if enabled
    #[must_use]
    pub fn gc_interval(&self) -> Option<Duration> {
        u64::try_from(self.gc_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Blocked caller limit, or `None` when blocking is disabled
    #[must_use]
    pub fn blocking_limit(&self) -> Option<usize> {
        usize::try_from(self.max_blocked).ok().filter(|n| *n > 0)
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 || self.capacity > MAX_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "Capacity must be between 1 and {MAX_CAPACITY}, got: {}",
                self.capacity
            )));
        }

        if self.max_blocked > MAX_BLOCKED {
            return Err(Error::InvalidConfig(format!(
                "Maximum blocks exceeds limit of {MAX_BLOCKED}, got: {}",
                self.max_blocked
            )));
        }

        if self.gc_interval_ms != -1 && self.gc_interval_ms < MIN_GC_INTERVAL_MS {
            return Err(Error::InvalidConfig(format!(
                "Invalid collect inactive worker ms, must be -1 or at least {MIN_GC_INTERVAL_MS}, got: {}",
                self.gc_interval_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        pool: PoolConfig,
    }

    #[test]
    fn test_default_values() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.pool_type, PoolType::Stack);
        assert!(!config.pre_spawn);
        assert_eq!(config.max_blocked, -1);
        assert_eq!(config.gc_interval_ms, -1);
        assert_eq!(config.gc_interval(), None);
        assert_eq!(config.blocking_limit(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_cli_defaults_match() {
        let cli = Cli::try_parse_from(["pool"]).unwrap();
        assert_eq!(cli.pool, PoolConfig::default());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "pool",
            "--pool-type",
            "queue",
            "--capacity",
            "64",
            "--pre-spawn",
            "--max-blocked",
            "-1",
            "--gc-interval-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.pool.pool_type, PoolType::Queue);
        assert_eq!(cli.pool.capacity, 64);
        assert!(cli.pool.pre_spawn);
        assert_eq!(cli.pool.gc_interval(), Some(Duration::from_millis(250)));
        cli.pool.validate().unwrap();
    }

    #[test]
    fn test_pool_type_from_str() {
        assert_eq!("stack".parse::<PoolType>().unwrap(), PoolType::Stack);
        assert_eq!("queue".parse::<PoolType>().unwrap(), PoolType::Queue);
        let err = "heap".parse::<PoolType>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Invalid pool type, only \"stack\" or \"queue\" supported"
        );
        assert_eq!(PoolType::Queue.to_string(), "queue");
    }

    #[rstest]
    #[case(PoolConfig::new().with_capacity(0))]
    #[case(PoolConfig::new().with_capacity(MAX_CAPACITY + 1))]
    #[case(PoolConfig::new().with_max_blocked(MAX_BLOCKED + 1))]
    #[case(PoolConfig::new().with_gc_interval_ms(0))]
    #[case(PoolConfig::new().with_gc_interval_ms(99))]
    #[case(PoolConfig::new().with_gc_interval_ms(-2))]
    fn test_validate_rejects(#[case] config: PoolConfig) {
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[rstest]
    #[case(PoolConfig::new().with_capacity(1))]
    #[case(PoolConfig::new().with_capacity(MAX_CAPACITY))]
    #[case(PoolConfig::new().with_max_blocked(MAX_BLOCKED))]
    #[case(PoolConfig::new().with_max_blocked(0))]
    #[case(PoolConfig::new().with_gc_interval_ms(MIN_GC_INTERVAL_MS))]
    #[case(PoolConfig::new().with_pool_type(PoolType::Queue).with_pre_spawn(true))]
    fn test_validate_accepts(#[case] config: PoolConfig) {
        config.validate().unwrap();
    }

    #[test]
    fn test_blocking_limit() {
        assert_eq!(PoolConfig::new().with_max_blocked(0).blocking_limit(), None);
        assert_eq!(PoolConfig::new().with_max_blocked(3).blocking_limit(), Some(3));
    }
}
