//! # Kernel configuration.
//!
//! [`KernelConfig`] centralizes the timing knobs of the kernel:
//! - `kill_timeout` bounds the whole shutdown;
//! - `health_check` bounds stage boot and every single health probe;
//! - `bus_capacity` sizes the event ring buffer.
//!
//! ## Sentinel values
//! - `health_check.wait_interval = 0s` is clamped to 1ms so boot polling never spins.
//! - `bus_capacity = 0` is clamped to 1.

use std::time::Duration;

/// Health check settings used while booting stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Time a stage may take until all its health-checked modules report healthy.
    /// Also bounds every single `is_healthy` call.
    pub timeout: Duration,

    /// Pause between two health polls of a booting stage.
    pub wait_interval: Duration,
}

impl Default for HealthCheckConfig {
    /// `timeout = 60s`, `wait_interval = 3s`.
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            wait_interval: Duration::from_secs(3),
        }
    }
}

/// Global configuration of the kernel.
///
/// ## Field semantics
/// - `kill_timeout`: time between the stop request and a forced exit
/// - `health_check`: see [`HealthCheckConfig`]
/// - `bus_capacity`: event bus ring buffer size (min 1)
///
/// All fields are public; prefer the helper accessors over sentinel checks.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Maximum time the stages may take to stop once the kernel is stopping.
    ///
    /// When it expires the modules still running are logged and the process
    /// exits with [`ExitCode::Forced`](crate::ExitCode::Forced).
    pub kill_timeout: Duration,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,
}

impl KernelConfig {
    /// Poll interval clamped to a minimum of 1ms.
    #[inline]
    pub fn wait_interval_clamped(&self) -> Duration {
        self.health_check.wait_interval.max(Duration::from_millis(1))
    }

    /// Bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for KernelConfig {
    /// Default configuration:
    ///
    /// - `kill_timeout = 10s`
    /// - `health_check = { timeout: 60s, wait_interval: 3s }`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            kill_timeout: Duration::from_secs(10),
            health_check: HealthCheckConfig::default(),
            bus_capacity: 1024,
        }
    }
}
