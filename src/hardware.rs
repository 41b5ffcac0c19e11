//! Core-count introspection used to size the worker pool.
//!
//! The engine consumes exactly one fact about the host: how many logical
//! cores it has. The probe lives behind [`CoreCountProvider`] so tests and
//! embedders can substitute a fixed value.

use std::sync::OnceLock;

use sysinfo::System;

/// Core count assumed when every probe fails.
const DEFAULT_CORE_COUNT: usize = 2;

/// Source of the host's logical core count.
pub trait CoreCountProvider: Send + Sync {
    fn cores(&self) -> usize;
}

/// Probes the host via `sysinfo`, falling back to
/// `std::thread::available_parallelism`, then to a floor of 2 cores.
///
/// The probe runs once per process; later calls return the cached value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCores;

static CACHED_CORES: OnceLock<usize> = OnceLock::new();

impl SystemCores {
    fn probe() -> usize {
        let sys = System::new_all();
        let count = sys.cpus().len();
        if count > 0 {
            return count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_CORE_COUNT)
    }
}

impl CoreCountProvider for SystemCores {
    fn cores(&self) -> usize {
        *CACHED_CORES.get_or_init(Self::probe)
    }
}

/// Fixed core count, for tests and embedders that size the pool themselves.
#[derive(Debug, Clone, Copy)]
pub struct FixedCores(pub usize);

impl CoreCountProvider for FixedCores {
    fn cores(&self) -> usize {
        self.0.max(1)
    }
}
