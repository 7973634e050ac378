// fatal.rs - Failure-during-failure handling
//
// A fault raised while this thread is already building or converting another
// fault cannot be assumed to leave the engine recoverable. Those paths abort.

use once_cell::sync::OnceCell;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static HANDLING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// What gets reported right before the process aborts.
#[derive(Debug, Clone)]
pub struct FatalReport {
    pub reason: String,
    pub thread: Option<String>,
}

type FatalHook = Box<dyn Fn(&FatalReport) + Send + Sync>;

static FATAL_HOOK: OnceCell<FatalHook> = OnceCell::new();

/// Install a hook that runs before a fatal abort (flush logs, write a crash
/// marker). Only the first installation wins.
pub fn set_fatal_hook(hook: impl Fn(&FatalReport) + Send + Sync + 'static) -> bool {
    FATAL_HOOK.set(Box::new(hook)).is_ok()
}

/// Abort the process. Never unwinds.
pub fn fail_fast(reason: impl Into<String>) -> ! {
    let report = FatalReport {
        reason: reason.into(),
        thread: std::thread::current().name().map(str::to_string),
    };
    tracing::error!(reason = %report.reason, thread = ?report.thread, "fatal fault, aborting");
    if let Some(hook) = FATAL_HOOK.get() {
        hook(&report);
    }
    eprintln!("tether: fatal: {}", report.reason);
    std::process::abort()
}

/// Marks the current thread as busy handling a fault.
///
/// Entering while another guard is live on the same thread is fatal.
pub struct FaultHandling {
    _not_send: PhantomData<*const ()>,
}

impl FaultHandling {
    pub fn enter(what: &str) -> Self {
        let depth = HANDLING_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });
        if depth > 0 {
            fail_fast(format!("fault raised while handling a prior fault ({what})"));
        }
        Self {
            _not_send: PhantomData,
        }
    }

    /// Abort if a fault is being raised inside a handling region.
    pub fn check_raise(what: &str) {
        if Self::depth() > 0 {
            fail_fast(format!("fault raised while handling a prior fault ({what})"));
        }
    }

    /// Number of live guards on this thread.
    pub fn depth() -> u32 {
        HANDLING_DEPTH.with(Cell::get)
    }
}

impl Drop for FaultHandling {
    fn drop(&mut self) {
        HANDLING_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_depth() {
        assert_eq!(FaultHandling::depth(), 0);
        {
            let _guard = FaultHandling::enter("test");
            assert_eq!(FaultHandling::depth(), 1);
        }
        assert_eq!(FaultHandling::depth(), 0);

        // Sequential faults are fine, only nesting is fatal
        drop(FaultHandling::enter("first"));
        drop(FaultHandling::enter("second"));
        assert_eq!(FaultHandling::depth(), 0);
        FaultHandling::check_raise("outside any region");
    }
}
