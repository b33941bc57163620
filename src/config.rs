//! Runtime configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `WEFT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `WEFT_WORKERS` | Number of worker threads | CPU count |
//! | `WEFT_STACK_SIZE` | Fiber stack size in bytes | 1048576 (1 MiB) |
//! | `WEFT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::config::RuntimeConfig;
//!
//! // Load from environment with defaults, then install globally.
//! RuntimeConfig::from_env().install();
//!
//! // Or use the builder pattern.
//! RuntimeConfig::default()
//!     .workers(4)
//!     .stack_size(256 * 1024)
//!     .install();
//! ```

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::log::LogLevel;

/// Default fiber stack size: 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Smallest stack size accepted for a fiber. Values below this are
/// clamped; a stack this small only fits trivial bodies.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub workers: usize,

    /// Fiber stack size in bytes.
    /// Default: 1 MiB.
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum level written to the sink.
    pub level: LogLevel,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workers) = parse_env("WEFT_WORKERS") {
            if workers > 0 {
                config.scheduler.workers = workers;
            }
        }
        if let Some(size) = parse_env("WEFT_STACK_SIZE") {
            config.scheduler.stack_size = size;
        }
        if let Ok(level) = env::var("WEFT_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&level) {
                config.log.level = level;
            }
        }

        config.validate()
    }

    /// Set the worker-thread count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.scheduler.workers = workers;
        self
    }

    /// Set the fiber stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.scheduler.stack_size = bytes;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log.level = level;
        self
    }

    /// Clamp out-of-range values.
    fn validate(mut self) -> Self {
        if self.scheduler.workers == 0 {
            self.scheduler.workers = 1;
        }
        if self.scheduler.stack_size < MIN_STACK_SIZE {
            self.scheduler.stack_size = MIN_STACK_SIZE;
        }
        self
    }

    /// Install this configuration process-wide.
    ///
    /// Applies the log level and the fiber stack size immediately; the
    /// full struct is retained for later inspection via
    /// [`runtime_config`]. Only the first install wins for the
    /// retained copy, but the stack size and log level are applied on
    /// every call (the hot-update path).
    pub fn install(self) {
        let config = self.validate();
        crate::log::set_level(config.log.level);
        set_default_stack_size(config.scheduler.stack_size);
        let _ = GLOBAL.set(config);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// The installed runtime configuration, if any.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    GLOBAL.get()
}

/// The default-fiber-stack-size tunable. Zero means "not set": fall
/// back to [`DEFAULT_STACK_SIZE`]. Fibers read this at construction
/// time, so updates apply to every fiber created afterwards.
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The stack size used for fibers constructed with `stack_size == 0`.
pub fn default_stack_size() -> usize {
    match STACK_SIZE.load(Ordering::Relaxed) {
        0 => DEFAULT_STACK_SIZE,
        n => n,
    }
}

/// Hot-update the default fiber stack size. Takes effect for fibers
/// constructed after the call; existing fibers keep their stacks.
pub fn set_default_stack_size(bytes: usize) {
    STACK_SIZE.store(bytes.max(MIN_STACK_SIZE), Ordering::Relaxed);
}

/// Number of available CPUs, with a fallback of 1.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_env(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.workers >= 1);
        assert_eq!(config.scheduler.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::default()
            .workers(3)
            .stack_size(128 * 1024)
            .log_level(LogLevel::Debug);
        assert_eq!(config.scheduler.workers, 3);
        assert_eq!(config.scheduler.stack_size, 128 * 1024);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_validate_clamps() {
        let config = RuntimeConfig::default().workers(0).stack_size(1).validate();
        assert_eq!(config.scheduler.workers, 1);
        assert_eq!(config.scheduler.stack_size, MIN_STACK_SIZE);
    }

    #[test]
    fn test_stack_size_hot_update() {
        let before = default_stack_size();
        set_default_stack_size(2 * 1024 * 1024);
        assert_eq!(default_stack_size(), 2 * 1024 * 1024);
        set_default_stack_size(1);
        assert_eq!(default_stack_size(), MIN_STACK_SIZE);
        set_default_stack_size(before);
    }

    #[test]
    fn test_env_parsing() {
        env::set_var("WEFT_WORKERS", "2");
        env::set_var("WEFT_STACK_SIZE", "262144");
        env::set_var("WEFT_LOG_LEVEL", "debug");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.stack_size, 262144);
        assert_eq!(config.log.level, LogLevel::Debug);
        env::remove_var("WEFT_WORKERS");
        env::remove_var("WEFT_STACK_SIZE");
        env::remove_var("WEFT_LOG_LEVEL");
    }
}
