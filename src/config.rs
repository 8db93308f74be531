//! Dispatcher tuning constants (spec.md §6, §9).
//!
//! Library callers construct a `DispatcherConfig` directly; the standalone
//! binary (`src/bin/dispatcherd.rs`) reads `BROADCASTD_*` env var overrides
//! the way `sem_os_server::main` reads `SEM_OS_*` overrides.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `MAX_RUNNING_PROCESS_QUEUES` — fixed capacity of the running set.
    pub max_running_process_queues: usize,
    /// `MAX_RUNNING_ACTIVE_BROADCASTS` — queue retires from its slot after
    /// this many active broadcasts since it last went idle.
    pub max_running_active_broadcasts: u32,
    /// Soft-timeout length for foreground delivery.
    pub timeout_foreground: Duration,
    /// Soft-timeout length for background delivery.
    pub timeout_background: Duration,
    /// Hard cap on the CPU-starvation soft-timeout extension.
    pub timeout_cap: Duration,
    /// `ALLOW_BG_ACTIVITY_START_TIMEOUT`.
    pub allow_bg_activity_start_timeout: Duration,
    /// Interval between health-check audit passes.
    pub health_check_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_running_process_queues: 4,
            max_running_active_broadcasts: 16,
            timeout_foreground: Duration::from_secs(10),
            timeout_background: Duration::from_secs(60),
            timeout_cap: Duration::from_secs(60),
            allow_bg_activity_start_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    /// Read overrides from `BROADCASTD_*` env vars, falling back to
    /// `Default::default()` for anything unset or unparseable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_running_process_queues: env_usize(
                "BROADCASTD_MAX_RUNNING_PROCESS_QUEUES",
                default.max_running_process_queues,
            ),
            max_running_active_broadcasts: env_u32(
                "BROADCASTD_MAX_RUNNING_ACTIVE_BROADCASTS",
                default.max_running_active_broadcasts,
            ),
            timeout_foreground: env_secs(
                "BROADCASTD_TIMEOUT_FOREGROUND_SECS",
                default.timeout_foreground,
            ),
            timeout_background: env_secs(
                "BROADCASTD_TIMEOUT_BACKGROUND_SECS",
                default.timeout_background,
            ),
            timeout_cap: env_secs("BROADCASTD_TIMEOUT_CAP_SECS", default.timeout_cap),
            allow_bg_activity_start_timeout: env_secs(
                "BROADCASTD_ALLOW_BG_ACTIVITY_START_TIMEOUT_SECS",
                default.allow_bg_activity_start_timeout,
            ),
            health_check_interval: env_secs(
                "BROADCASTD_HEALTH_CHECK_INTERVAL_SECS",
                default.health_check_interval,
            ),
        }
    }

    /// Select the soft-timeout length for a foreground-vs-background receiver.
    pub fn timeout_for(&self, foreground: bool) -> Duration {
        if foreground {
            self.timeout_foreground
        } else {
            self.timeout_background
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
