//! Process-wide sink for faults raised inside dispatch loops.
//!
//! Socket and handler failures never escape `run()`; they are routed here
//! instead. The default hook logs through `tracing`; embedders that need to
//! collect or count failures install their own hook once at startup.

use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::{PoisonError, RwLock};

/// Callback receiving `(context, message)` for every reported fault.
pub type ErrorHook = Box<dyn Fn(&str, &str) + Send + Sync>;

static HOOK: Lazy<RwLock<ErrorHook>> = Lazy::new(|| {
    RwLock::new(Box::new(|context, message| {
        tracing::error!(context, "{message}");
    }))
});

/// Replace the process-wide error hook.
pub fn set_hook(hook: ErrorHook) {
    *HOOK.write().unwrap_or_else(PoisonError::into_inner) = hook;
}

/// Report a fault to the process-wide hook.
pub fn report(context: &str, message: &str) {
    let hook = HOOK.read().unwrap_or_else(PoisonError::into_inner);
    hook(context, message);
}

/// Report a payload captured by `std::panic::catch_unwind`.
pub(crate) fn report_panic(context: &str, payload: Box<dyn Any + Send>) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    report(context, &message);
}
