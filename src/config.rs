//! Dispatcher configuration.
//!
//! Configuration can be set via environment variables:
//! - `TASKLANE_POOL_MULTIPLIER` - Optional. Worker permits per core. Defaults to `8`.
//! - `TASKLANE_POOL_CAP` - Optional. Upper bound on the worker pool. Defaults to `24`.
//! - `TASKLANE_CORES` - Optional. Overrides the probed core count (useful in
//!   containers whose cgroup quota differs from the host core count).

use crate::hardware::CoreCountProvider;
use crate::util::env_var_usize;

/// Default worker permits granted per logical core.
pub const DEFAULT_POOL_MULTIPLIER: usize = 8;
/// Default upper bound on worker pool size.
pub const DEFAULT_POOL_CAP: usize = 24;

/// Sizing knobs for a [`Dispatcher`](crate::Dispatcher).
///
/// The worker pool holds `min(cores × pool_multiplier, pool_cap)` permits,
/// fixed at dispatcher construction.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker permits granted per logical core.
    pub pool_multiplier: usize,
    /// Upper bound on the pool size regardless of core count.
    pub pool_cap: usize,
    /// Explicit core count; `None` asks the core-count provider.
    pub core_count: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_multiplier: DEFAULT_POOL_MULTIPLIER,
            pool_cap: DEFAULT_POOL_CAP,
            core_count: None,
        }
    }
}

impl DispatcherConfig {
    /// Build a config from `TASKLANE_*` environment variables, falling back
    /// to the defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let core_count = match env_var_usize("TASKLANE_CORES", 0) {
            0 => None,
            n => Some(n),
        };
        Self {
            pool_multiplier: env_var_usize("TASKLANE_POOL_MULTIPLIER", DEFAULT_POOL_MULTIPLIER)
                .max(1),
            pool_cap: env_var_usize("TASKLANE_POOL_CAP", DEFAULT_POOL_CAP).max(1),
            core_count,
        }
    }

    /// Resolve the worker pool size, probing `provider` when no explicit
    /// core count is configured.
    pub fn pool_size(&self, provider: &dyn CoreCountProvider) -> usize {
        let cores = self.core_count.unwrap_or_else(|| provider.cores()).max(1);
        (cores * self.pool_multiplier).min(self.pool_cap).max(1)
    }
}
