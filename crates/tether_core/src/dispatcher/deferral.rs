use super::Dispatcher;
use std::fmt;

/// Outstanding work that dispatcher shutdown has to wait for.
///
/// Released by dropping it; the release is queued behind any work already
/// posted, so a subscriber never observes completion before that work ran.
pub struct Deferral {
    dispatcher: Dispatcher,
}

impl Deferral {
    pub(super) fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Release explicitly. Same as dropping.
    pub fn complete(self) {}
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.dispatcher.release_deferral();
    }
}

impl fmt::Debug for Deferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferral").field(&self.dispatcher).finish()
    }
}
