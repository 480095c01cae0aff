//! Construction-time configuration.
//!
//! The whole configuration surface is three integers: the wheel's tick length
//! and slot count, and the pool's worker count. Values are validated once, when
//! the config is built, so components never observe a zero.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default tick length in milliseconds.
pub const DEFAULT_TICK_MILLIS: u64 = 100;
/// Default number of buckets per revolution.
pub const DEFAULT_TICK_COUNT: usize = 512;

/// Timer wheel sizing.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelConfig {
    pub name: String,
    pub tick_millis: u64,
    pub tick_count: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            name: "cadence-wheel".to_string(),
            tick_millis: DEFAULT_TICK_MILLIS,
            tick_count: DEFAULT_TICK_COUNT,
        }
    }
}

impl WheelConfig {
    /// Validated wheel config with the default name.
    pub fn new(tick_millis: u64, tick_count: usize) -> Result<Self, ConfigError> {
        let config = Self {
            tick_millis,
            tick_count,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_millis == 0 {
            return Err(ConfigError::ZeroTickMillis);
        }
        if self.tick_count == 0 {
            return Err(ConfigError::ZeroTickCount);
        }
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Worker pool sizing.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub parallelism: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "cadence-pool".to_string(),
            parallelism: default_parallelism(),
        }
    }
}

impl PoolConfig {
    pub fn new(parallelism: usize) -> Result<Self, ConfigError> {
        let config = Self {
            parallelism,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        Ok(())
    }
}

/// Available hardware parallelism, or 1 when it cannot be queried.
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Configuration for the composed scheduler.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub wheel: WheelConfig,
    pub pool: PoolConfig,
}

impl SchedulerConfig {
    /// Creates a new scheduler configuration builder.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.wheel.validate()?;
        self.pool.validate()
    }
}

/// Builder for ergonomic scheduler configuration construction.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Sets the prefix used for thread names.
    pub fn name(mut self, name: &str) -> Self {
        self.config.wheel.name = format!("{name}-wheel");
        self.config.pool.name = format!("{name}-pool");
        self
    }

    /// Sets the tick length in milliseconds.
    pub fn tick_millis(mut self, millis: u64) -> Self {
        self.config.wheel.tick_millis = millis;
        self
    }

    /// Sets the number of buckets per revolution.
    pub fn tick_count(mut self, count: usize) -> Self {
        self.config.wheel.tick_count = count;
        self
    }

    /// Sets the number of worker threads.
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.config.pool.parallelism = workers;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
