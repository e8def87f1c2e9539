//! Shared test helpers. `std::env::set_var`/`remove_var` affect the whole
//! process, so tests that mutate `WEAVE_RESOURCES`/`WEAVE_MAX_CONCURRENCY`
//! serialize through this lock to avoid racing each other under the default
//! multi-threaded test runner.

use std::sync::{Mutex, OnceLock};

pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
