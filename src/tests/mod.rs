//! End-to-end scenarios driven over the loopback stack. Every test spawns its
//! own stack context so addresses never collide across tests; tests assert
//! counter deltas against the process-wide registry, so traffic-generating
//! tests serialize on a shared lock.

mod poll;
mod raw;
mod tcp;

use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::context::{ContextHandle, StackContext};
use crate::stack::{LoopbackConfig, LoopbackStack};

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialize traffic-generating tests so counter deltas are attributable.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn new_context() -> ContextHandle {
    new_context_with(LoopbackConfig::default())
}

pub(crate) fn new_context_with(config: LoopbackConfig) -> ContextHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    crate::init();
    StackContext::spawn(Box::new(LoopbackStack::with_config(config))).handle()
}
