//! Process-wide panic hook chaining.
//!
//! Installing takes the current hook and wraps it: our capture runs first,
//! then the previous hook runs unchanged, so default stderr output (or any
//! hook the host installed) is preserved. Uninstalling hands the previous
//! hook back to `set_hook` as the same boxed closure, not a wrapper around it.

use std::panic::{self, PanicHookInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// The hook that was current at install, shared by our wrapper and the guard.
type PreviousSlot = Arc<RwLock<Option<PanicHook>>>;

static ACTIVE_HOOKS: AtomicUsize = AtomicUsize::new(0);

/// Number of faultline hooks currently installed in this process.
pub fn active_hooks() -> usize {
    ACTIVE_HOOKS.load(Ordering::SeqCst)
}

/// Owns an installed hook; dropping it restores the previous one.
pub struct HookGuard {
    previous: Option<PreviousSlot>,
}

/// Install `capture` in front of the current panic hook.
///
/// `capture` runs on the panicking thread before unwinding starts. It must
/// not block on locks the panicking thread might hold, and must not panic.
pub fn install<F>(capture: F) -> HookGuard
where
    F: Fn(&PanicHookInfo<'_>) + Sync + Send + 'static,
{
    let previous: PreviousSlot = Arc::new(RwLock::new(Some(panic::take_hook())));
    let chained = Arc::clone(&previous);
    panic::set_hook(Box::new(move |info| {
        capture(info);
        let guard = match chained.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.as_ref() {
            previous(info);
        }
    }));
    ACTIVE_HOOKS.fetch_add(1, Ordering::SeqCst);

    HookGuard {
        previous: Some(previous),
    }
}

impl HookGuard {
    /// Restore the hook that was active before [`install`].
    pub fn uninstall(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        let Some(slot) = self.previous.take() else {
            return;
        };
        // set_hook/take_hook panic when called from a panicking thread.
        if std::thread::panicking() {
            warn!("Panic hook left installed: agent dropped during unwinding");
            return;
        }
        // Once our wrapper is taken out no other thread can be running it,
        // so the slot is free to empty.
        drop(panic::take_hook());
        let previous = match slot.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(previous) = previous {
            panic::set_hook(previous);
        }
        ACTIVE_HOOKS.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

impl std::fmt::Debug for HookGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookGuard")
            .field("installed", &self.previous.is_some())
            .finish()
    }
}
