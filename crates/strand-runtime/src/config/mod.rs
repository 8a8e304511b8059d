//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. Override file named by `STRAND_CONFIG_RS` (compile-time)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .num_threads(4)
//!     .use_caller(false);
//! config.validate()?;
//! ```

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;

use strand_core::constants::MIN_STACK_SIZE;
use strand_core::env::{env_get, env_get_bool, env_get_ms};
use strand_core::{RuntimeError, RuntimeResult};

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default fiber stack size in bytes
    pub stack_size: usize,
    /// Worker threads per scheduler (including the caller when `use_caller`)
    pub num_threads: usize,
    /// Whether the constructing thread participates as a worker
    pub use_caller: bool,
    /// Upper bound on a single epoll wait
    pub max_wait: Duration,
    /// Readiness events fetched per epoll wait
    pub max_events: usize,
    /// Timeout applied by the hooked `connect`
    pub connect_timeout: Duration,
    /// Backward clock jump that expires every timer
    pub clock_rollover: Duration,
    /// Initial slot count of the fd tables
    pub fd_table_initial: usize,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STRAND_STACK_SIZE` - Fiber stack size in bytes
    /// - `STRAND_NUM_THREADS` - Worker threads per scheduler
    /// - `STRAND_USE_CALLER` - Caller thread is a worker (0/1)
    /// - `STRAND_MAX_WAIT_MS` - epoll wait cap in milliseconds
    /// - `STRAND_MAX_EVENTS` - Events per epoll wait
    /// - `STRAND_CONNECT_TIMEOUT_MS` - Hooked connect timeout
    /// - `STRAND_CLOCK_ROLLOVER_MS` - Clock rollback threshold
    /// - `STRAND_FD_TABLE_INITIAL` - Initial fd table size
    /// - `STRAND_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        let defaults = Self::new();
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults.stack_size),
            num_threads: env_get("STRAND_NUM_THREADS", defaults.num_threads),
            use_caller: env_get_bool("STRAND_USE_CALLER", defaults.use_caller),
            max_wait: env_get_ms("STRAND_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            max_events: env_get("STRAND_MAX_EVENTS", defaults.max_events),
            connect_timeout: env_get_ms("STRAND_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            clock_rollover: env_get_ms("STRAND_CLOCK_ROLLOVER_MS", defaults::CLOCK_ROLLOVER_MS),
            fd_table_initial: env_get("STRAND_FD_TABLE_INITIAL", defaults.fd_table_initial),
            debug_logging: env_get_bool("STRAND_DEBUG", defaults.debug_logging),
        }
    }

    /// Compile-time defaults only, no environment lookup.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            num_threads: defaults::NUM_THREADS,
            use_caller: defaults::USE_CALLER,
            max_wait: Duration::from_millis(defaults::MAX_WAIT_MS),
            max_events: defaults::MAX_EVENTS,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            clock_rollover: Duration::from_millis(defaults::CLOCK_ROLLOVER_MS),
            fd_table_initial: defaults::FD_TABLE_INITIAL,
            debug_logging: defaults::DEBUG_LOGGING || cfg!(feature = "debug-logging"),
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn clock_rollover(mut self, d: Duration) -> Self {
        self.clock_rollover = d;
        self
    }

    pub fn fd_table_initial(mut self, n: usize) -> Self {
        self.fd_table_initial = n;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.num_threads == 0 {
            return Err(RuntimeError::Config("num_threads must be > 0"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(RuntimeError::Config("stack_size must be >= 16KB"));
        }
        if self.max_events == 0 {
            return Err(RuntimeError::Config("max_events must be > 0"));
        }
        if self.fd_table_initial == 0 {
            return Err(RuntimeError::Config("fd_table_initial must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("strand configuration:");
        eprintln!("  stack_size:        {}", self.stack_size);
        eprintln!("  num_threads:       {}", self.num_threads);
        eprintln!("  use_caller:        {}", self.use_caller);
        eprintln!("  max_wait:          {:?}", self.max_wait);
        eprintln!("  max_events:        {}", self.max_events);
        eprintln!("  connect_timeout:   {:?}", self.connect_timeout);
        eprintln!("  clock_rollover:    {:?}", self.clock_rollover);
        eprintln!("  fd_table_initial:  {}", self.fd_table_initial);
        eprintln!("  debug_logging:     {}", self.debug_logging);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        if config.debug_logging {
            strand_core::kprint::set_log_level(strand_core::kprint::LogLevel::Debug);
        }
        config
    })
}

/// Install `config` as the process-wide configuration.
///
/// Fails if the configuration is invalid or `global()` was already used.
pub fn install(config: RuntimeConfig) -> RuntimeResult<()> {
    config.validate()?;
    let debug = config.debug_logging;
    GLOBAL
        .set(config)
        .map_err(|_| RuntimeError::Config("configuration already installed"))?;
    if debug {
        strand_core::kprint::set_log_level(strand_core::kprint::LogLevel::Debug);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::new();
        assert_eq!(config.max_wait, Duration::from_millis(defaults::MAX_WAIT_MS));
        assert!(config.validate().is_ok());
        assert!(global().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_threads(4)
            .use_caller(false)
            .connect_timeout(Duration::from_millis(250));

        assert_eq!(config.num_threads, 4);
        assert!(!config.use_caller);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_threads(0).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(4096).validate().is_err());
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
    }

    #[test]
    fn test_install_after_use_fails() {
        let _ = global();
        assert!(install(RuntimeConfig::new()).is_err());
    }
}
