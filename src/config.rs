//! Top-level configuration: one builder-validated struct per subsystem,
//! assembled into [`CoreConfig`], following the same
//! `BrowserPoolConfig`/`BrowserPoolConfigBuilder` pattern (doc tables,
//! `Considerations` sections, a validating builder) for every tunable
//! across the pool, circuit breaker, scaler, session store, and health
//! monitor.
//!
//! # Example
//!
//! ```rust
//! use browser_pool_core::config::CoreConfigBuilder;
//!
//! let config = CoreConfigBuilder::new()
//!     .max_browsers(10)
//!     .min_browsers(2)
//!     .build()
//!     .expect("invalid configuration");
//!
//! assert_eq!(config.pool.max_browsers, 10);
//! ```
//!
//! # Environment Configuration
//!
//! When the `env-config` feature is enabled, [`env::from_env`] loads every
//! tunable below from an environment variable (optionally staged through an
//! `app.env` file), falling back to the same defaults as
//! [`CoreConfigBuilder::build`].

use std::time::Duration;

use crate::browser::pool::BrowserPoolConfig;
use crate::circuit::CircuitBreakerConfig;
use crate::driver::DriverLaunchOptions;
use crate::scaler::ScalerConfig;

/// Tunables for the C3 session store's background purge loop.
#[derive(Debug, Clone, Copy)]
pub struct SessionStoreConfig {
    /// Default session lifetime when a caller does not specify one.
    pub default_session_duration: Duration,
    /// How often the purge loop sweeps for expired sessions.
    pub purge_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            default_session_duration: Duration::from_secs(3600),
            purge_interval: crate::session::DEFAULT_PURGE_INTERVAL,
        }
    }
}

/// Tunables for the C8 page manager's idle-sweep loop.
#[derive(Debug, Clone, Copy)]
pub struct PageManagerConfig {
    pub idle_sweep_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for PageManagerConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval: crate::page::DEFAULT_IDLE_SWEEP_INTERVAL,
            idle_threshold: crate::page::DEFAULT_IDLE_THRESHOLD,
        }
    }
}

/// Tunables for the C12 health monitor's tick loop.
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    pub tick_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Every subsystem's configuration, assembled in one place.
///
/// # Fields Overview
///
/// | Field | Default source | Description |
/// |-------|-----------------|-------------|
/// | `pool` | [`BrowserPoolConfig::default`] | Pool sizing, timeouts, launch options |
/// | `circuit_breaker` | [`CircuitBreakerConfig::default`] | Shared breaker tunables (pool installs one per key) |
/// | `scaler` | [`ScalerConfig::default`] | Utilization-driven scale policy |
/// | `session_store` | [`SessionStoreConfig::default`] | Session TTL and purge cadence |
/// | `page_manager` | [`PageManagerConfig::default`] | Idle-page sweep cadence |
/// | `health_monitor` | [`HealthMonitorConfig::default`] | Liveness tick cadence |
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub pool: BrowserPoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scaler: ScalerConfig,
    pub session_store: SessionStoreConfig,
    pub page_manager: PageManagerConfig,
    pub health_monitor: HealthMonitorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: BrowserPoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scaler: ScalerConfig::default(),
            session_store: SessionStoreConfig::default(),
            page_manager: PageManagerConfig::default(),
            health_monitor: HealthMonitorConfig::default(),
        }
    }
}

/// Validating builder for [`CoreConfig`], following the same pattern as
/// `BrowserPoolConfigBuilder`.
#[derive(Debug, Clone, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum browsers the pool will hold (idle + active).
    ///
    /// # Default
    ///
    /// 5 browsers
    pub fn max_browsers(mut self, n: usize) -> Self {
        self.config.pool.max_browsers = n;
        self
    }

    /// Browsers never drained below this count by the scaler.
    ///
    /// # Default
    ///
    /// 1 browser
    pub fn min_browsers(mut self, n: usize) -> Self {
        self.config.pool.min_browsers = n;
        self
    }

    /// Maximum concurrently open pages per browser.
    ///
    /// # Default
    ///
    /// 5 pages
    pub fn max_pages_per_browser(mut self, n: u32) -> Self {
        self.config.pool.max_pages_per_browser = n;
        self
    }

    /// How long `acquire` waits in the FIFO queue before failing with
    /// `ResourceExhausted`.
    ///
    /// # Default
    ///
    /// 10 seconds
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    /// Override the driver's launch options (headless, binary path,
    /// window size, sandboxing).
    pub fn launch_options(mut self, options: DriverLaunchOptions) -> Self {
        self.config.pool.launch_options = options;
        self
    }

    /// Default lifetime granted to a session that does not specify one.
    ///
    /// # Default
    ///
    /// 1 hour
    pub fn default_session_duration(mut self, duration: Duration) -> Self {
        self.config.session_store.default_session_duration = duration;
        self
    }

    /// Validate and produce the final [`CoreConfig`].
    ///
    /// # Errors
    ///
    /// Returns a message (not [`crate::error::CoreError`], since this runs
    /// before any component that needs the richer type exists) when:
    /// - `max_browsers == 0`
    /// - `min_browsers > max_browsers`
    /// - `max_pages_per_browser == 0`
    pub fn build(self) -> Result<CoreConfig, String> {
        let pool = &self.config.pool;
        if pool.max_browsers == 0 {
            return Err("max_browsers must be greater than 0".into());
        }
        if pool.min_browsers > pool.max_browsers {
            return Err(format!(
                "min_browsers ({}) cannot exceed max_browsers ({})",
                pool.min_browsers, pool.max_browsers
            ));
        }
        if pool.max_pages_per_browser == 0 {
            return Err("max_pages_per_browser must be greater than 0".into());
        }
        Ok(self.config)
    }
}

/// Environment-variable configuration loading (`env-config` feature).
///
/// An optional `app.env` file
/// (not `.env`, for cross-platform visibility) is loaded first via
/// `dotenvy`, then every variable below is read with the same default
/// [`CoreConfigBuilder::build`] would otherwise use.
///
/// | Variable | Type | Default | Description |
/// |----------|------|---------|--------------|
/// | `BROWSER_POOL_MAX` | usize | 5 | Maximum browsers in pool |
/// | `BROWSER_POOL_MIN` | usize | 1 | Browsers never drained below this |
/// | `BROWSER_MAX_PAGES` | u32 | 5 | Max concurrent pages per browser |
/// | `BROWSER_ACQUIRE_TIMEOUT_SECONDS` | u64 | 10 | Acquire queue wait timeout |
/// | `BROWSER_HEALTH_CHECK_INTERVAL_SECONDS` | u64 | 30 | Pool liveness probe cadence |
/// | `SESSION_DEFAULT_DURATION_SECONDS` | u64 | 3600 | Default session TTL |
/// | `SESSION_PURGE_INTERVAL_SECONDS` | u64 | 60 | Expired-session sweep cadence |
/// | `PAGE_IDLE_SWEEP_INTERVAL_SECONDS` | u64 | 300 | Idle-page sweep cadence |
/// | `PAGE_IDLE_THRESHOLD_SECONDS` | u64 | 1800 | Idle age before a page is swept |
/// | `HEALTH_TICK_INTERVAL_SECONDS` | u64 | 30 | Health monitor tick cadence |
/// | `RECYCLE_AFTER_PAGES` | u64 | 500 | Pages served before a browser is a recycle candidate |
/// | `RECYCLE_AFTER_AGE_SECONDS` | u64 | 7200 | Age before a browser is a recycle candidate |
/// | `RECYCLE_AFTER_MEMORY_BYTES` | u64 | 1073741824 | Estimated memory before a browser is a recycle candidate |
/// | `RECYCLE_AFTER_ERRORS` | u64 | 20 | Driver error count before a browser is a recycle candidate |
/// | `CHROME_PATH` | String | auto-detected | Custom Chrome/Chromium binary path |
#[cfg(feature = "env-config")]
pub mod env {
    use super::*;
    use std::env;

    /// Name of the optional env file loaded before reading the process
    /// environment: `app.env`, not `.env`, for cross-platform visibility.
    pub const ENV_FILE_NAME: &str = "app.env";

    /// Load `app.env` into the process environment, if present. Never
    /// fails if the file is absent, only on a malformed file.
    pub fn load_env_file() -> Result<(), dotenvy::Error> {
        match dotenvy::from_filename(ENV_FILE_NAME) {
            Ok(_) => Ok(()),
            Err(dotenvy::Error::Io(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn duration_var(name: &str, default_secs: u64) -> Duration {
        let secs = env::var(name)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default_secs);
        Duration::from_secs(secs)
    }

    fn usize_var(name: &str, default: usize) -> usize {
        env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn u32_var(name: &str, default: u32) -> u32 {
        env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn u64_var(name: &str, default: u64) -> u64 {
        env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Chrome/Chromium binary path, if set.
    pub fn chrome_path_from_env() -> Option<String> {
        env::var("CHROME_PATH").ok()
    }

    /// Load `app.env` (if present) then build a [`CoreConfig`] from the
    /// process environment, applying defaults for anything unset.
    pub fn from_env() -> Result<CoreConfig, String> {
        load_env_file().map_err(|e| format!("failed to load {ENV_FILE_NAME}: {e}"))?;

        let defaults = CoreConfig::default();
        let mut launch_options = defaults.pool.launch_options.clone();
        launch_options.binary_path = chrome_path_from_env();

        let builder = CoreConfigBuilder::new()
            .max_browsers(usize_var("BROWSER_POOL_MAX", defaults.pool.max_browsers))
            .min_browsers(usize_var("BROWSER_POOL_MIN", defaults.pool.min_browsers))
            .max_pages_per_browser(u32_var("BROWSER_MAX_PAGES", defaults.pool.max_pages_per_browser))
            .acquire_timeout(duration_var(
                "BROWSER_ACQUIRE_TIMEOUT_SECONDS",
                defaults.pool.acquire_timeout.as_secs(),
            ))
            .default_session_duration(duration_var(
                "SESSION_DEFAULT_DURATION_SECONDS",
                defaults.session_store.default_session_duration.as_secs(),
            ))
            .launch_options(launch_options);

        let mut config = builder.build()?;
        config.pool.health_check_interval = duration_var(
            "BROWSER_HEALTH_CHECK_INTERVAL_SECONDS",
            defaults.pool.health_check_interval.as_secs(),
        );
        config.session_store.purge_interval = duration_var(
            "SESSION_PURGE_INTERVAL_SECONDS",
            defaults.session_store.purge_interval.as_secs(),
        );
        config.page_manager.idle_sweep_interval = duration_var(
            "PAGE_IDLE_SWEEP_INTERVAL_SECONDS",
            defaults.page_manager.idle_sweep_interval.as_secs(),
        );
        config.page_manager.idle_threshold = duration_var(
            "PAGE_IDLE_THRESHOLD_SECONDS",
            defaults.page_manager.idle_threshold.as_secs(),
        );
        config.health_monitor.tick_interval = duration_var(
            "HEALTH_TICK_INTERVAL_SECONDS",
            defaults.health_monitor.tick_interval.as_secs(),
        );
        config.scaler.recycle_after_pages = u64_var("RECYCLE_AFTER_PAGES", defaults.scaler.recycle_after_pages);
        config.scaler.recycle_after_age = duration_var(
            "RECYCLE_AFTER_AGE_SECONDS",
            defaults.scaler.recycle_after_age.as_secs(),
        );
        config.scaler.recycle_after_memory_bytes =
            u64_var("RECYCLE_AFTER_MEMORY_BYTES", defaults.scaler.recycle_after_memory_bytes);
        config.scaler.recycle_after_errors = u64_var("RECYCLE_AFTER_ERRORS", defaults.scaler.recycle_after_errors);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = CoreConfig::default();
        assert!(config.pool.min_browsers <= config.pool.max_browsers);
        assert!(config.pool.max_pages_per_browser > 0);
    }

    #[test]
    fn builder_rejects_zero_max_browsers() {
        let err = CoreConfigBuilder::new().max_browsers(0).build().unwrap_err();
        assert!(err.contains("max_browsers"));
    }

    #[test]
    fn builder_rejects_min_above_max() {
        let err = CoreConfigBuilder::new()
            .max_browsers(2)
            .min_browsers(5)
            .build()
            .unwrap_err();
        assert!(err.contains("min_browsers"));
    }

    #[test]
    fn builder_applies_overrides() {
        let config = CoreConfigBuilder::new()
            .max_browsers(10)
            .min_browsers(2)
            .max_pages_per_browser(8)
            .build()
            .unwrap();
        assert_eq!(config.pool.max_browsers, 10);
        assert_eq!(config.pool.min_browsers, 2);
        assert_eq!(config.pool.max_pages_per_browser, 8);
    }
}
