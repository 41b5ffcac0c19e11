//! Shared utility functions used across the engine.

use std::sync::{Mutex, MutexGuard};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Shortest task id `random_task_id` will produce.
const TASK_ID_MIN_LEN: usize = 10;
/// Longest task id `random_task_id` will produce.
const TASK_ID_MAX_LEN: usize = 25;

/// Generate an opaque task identifier: a random alphanumeric string of
/// 10–25 characters.
///
/// Ids are meant to disambiguate log lines, not to be globally unique.
pub fn random_task_id() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(TASK_ID_MIN_LEN..=TASK_ID_MAX_LEN);
    (&mut rng)
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Parse an environment variable as a `usize`, returning `default` if the
/// variable is unset and logging a warning if it is set but unparseable.
pub fn env_var_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(var = name, value = %value, "ignoring unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Lock a mutex, absorbing poisoning.
///
/// The guarded containers hold plain data (state enums, maps, listener
/// lists) that stay consistent even if a holder panicked mid-update.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
