// task.rs - Host-side futures polled by the owner loop
//
// Each poll is an ordinary work item. Waking a task queues one more poll;
// a task already queued is not queued twice.

use super::{Deferral, Dispatcher};
use crate::fault::{Fault, UsageFault};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(super) struct Task {
    dispatcher: Dispatcher,
    future: Mutex<Option<BoxFuture>>,
    // Held until the future finishes so shutdown waits for it
    deferral: Mutex<Option<Deferral>>,
    queued: AtomicBool,
}

impl Task {
    pub(super) fn start(
        dispatcher: Dispatcher,
        future: BoxFuture,
        deferral: Deferral,
    ) -> Result<(), Fault> {
        let task = Arc::new(Task {
            dispatcher,
            future: Mutex::new(Some(future)),
            deferral: Mutex::new(Some(deferral)),
            queued: AtomicBool::new(false),
        });
        if !task.clone().schedule() {
            return Err(UsageFault::DispatcherClosed {
                operation: "Dispatcher::spawn",
            }
            .into());
        }
        Ok(())
    }

    fn schedule(self: Arc<Self>) -> bool {
        if self.queued.swap(true, Ordering::AcqRel) {
            return true;
        }
        let task = self.clone();
        let posted = self.dispatcher.try_enqueue(Box::new(move || task.poll()));
        if !posted {
            self.queued.store(false, Ordering::Release);
            tracing::warn!("task woken after its dispatcher shut down");
        }
        posted
    }

    fn poll(self: Arc<Self>) {
        self.queued.store(false, Ordering::Release);
        let mut slot = self.future.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(future) = slot.as_mut() else {
            return;
        };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let finished = match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => true,
            Ok(Poll::Pending) => false,
            Err(_) => {
                tracing::error!("spawned task panicked");
                true
            }
        };
        if finished {
            *slot = None;
            drop(slot);
            self.deferral
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::super::ShutdownState;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Pending on first poll, waking itself; ready on the second.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn test_spawned_future_is_polled_on_owner() {
        let dispatcher = Dispatcher::for_current_thread(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        dispatcher
            .spawn(async move {
                YieldOnce(false).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        dispatcher.shutdown(|| {});
        dispatcher.pump().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.shutdown_state(), ShutdownState::Requested);

        // Second poll finishes the task, third batch releases its deferral
        dispatcher.pump().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        dispatcher.pump().unwrap();
        assert_eq!(dispatcher.shutdown_state(), ShutdownState::Completed);
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let dispatcher = Dispatcher::for_current_thread(4);
        dispatcher.shutdown(|| {});
        dispatcher.pump().unwrap();
        assert!(dispatcher.spawn(async {}).is_err());
    }
}
