//! Single-owner work queue
//!
//! A [`Dispatcher`] belongs to the thread that created it. Any thread may
//! enqueue work; only the owner drains it. The queue is a writer/reader pair:
//! producers push onto the writer under the lock, the owner swaps the two and
//! runs the reader with the lock released, so work may freely enqueue more
//! work. Items run in FIFO order.
//!
//! Shutdown is cooperative. Once requested, the loop keeps draining until the
//! queue is empty and every outstanding [`Deferral`] has been released, then
//! runs the completion subscribers exactly once and rejects further work.

mod deferral;
mod task;

pub use deferral::Deferral;

use crate::fault::{Fault, UsageFault};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tether_metrics::{metrics, BatchTimer, Counter};
use tokio::sync::oneshot;

/// A unit of work for the owner thread.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

const BATCH_HISTORY: usize = 64;

enum Job {
    Run(Work),
    ReleaseDeferral,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Requested,
    Completed,
}

struct QueueState {
    writer: Vec<Job>,
    shutdown: ShutdownState,
    deferrals: usize,
    completions: Vec<Work>,
    counter: Counter,
    timer: BatchTimer,
}

struct Shared {
    id: u64,
    owner: ThreadId,
    capacity: usize,
    state: Mutex<QueueState>,
    wake: Condvar,
}

/// Point-in-time view of a dispatcher. Throughput fields stay at zero unless
/// the `metrics` feature is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherStats {
    pub state: ShutdownState,
    pub pending: usize,
    pub deferrals: usize,
    pub posted: usize,
    pub processed: usize,
    pub inline: usize,
    pub rejected: usize,
    pub panicked: usize,
    pub average_batch_len: f64,
    pub average_drain_ms: f64,
    /// Fastest and slowest recent drain, in milliseconds.
    pub drain_range_ms: (f64, f64),
}

/// Cloneable handle to a thread's work queue.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Create a dispatcher owned by the calling thread.
    pub fn for_current_thread(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
                owner: thread::current().id(),
                capacity,
                state: Mutex::new(QueueState {
                    writer: Vec::with_capacity(capacity),
                    shutdown: ShutdownState::Running,
                    deferrals: 0,
                    completions: Vec::new(),
                    counter: Counter::new(),
                    timer: BatchTimer::new(BATCH_HISTORY),
                }),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Queue `work` for the owner thread. Returns false once shutdown has
    /// completed.
    pub fn try_enqueue(&self, work: Work) -> bool {
        let mut state = self.lock();
        if state.shutdown == ShutdownState::Completed {
            metrics! {
                state.counter.increment("rejected", 1);
            }
            tracing::debug!(dispatcher = self.shared.id, "work rejected after shutdown");
            return false;
        }
        state.writer.push(Job::Run(work));
        metrics! {
            state.counter.increment("posted", 1);
        }
        drop(state);
        self.shared.wake.notify_all();
        true
    }

    /// Run `work` inline when called on the owner thread with `allow_sync`,
    /// otherwise queue it.
    pub fn post(&self, work: Work, allow_sync: bool) -> bool {
        if allow_sync && self.is_owner_thread() {
            metrics! {
                self.lock().counter.increment("inline", 1);
            }
            work();
            return true;
        }
        self.try_enqueue(work)
    }

    /// Run `f` on the owner thread and wait for its result.
    ///
    /// On the owner thread `f` runs inline when `allow_sync` is set; without
    /// it the call would wait on itself and fails with `WouldDeadlock`. A
    /// panic inside `f` is resumed on the caller.
    pub fn run<R, F>(&self, allow_sync: bool, f: F) -> Result<R, Fault>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let operation = "Dispatcher::run";
        if self.is_owner_thread() {
            if allow_sync {
                metrics! {
                    self.lock().counter.increment("inline", 1);
                }
                return Ok(f());
            }
            return Err(UsageFault::WouldDeadlock { operation }.into());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let posted = self.try_enqueue(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        }));
        if !posted {
            return Err(UsageFault::DispatcherClosed { operation }.into());
        }
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(UsageFault::DispatcherClosed { operation }.into()),
        }
    }

    /// Queue `f` for the owner thread and await its result. Never runs inline,
    /// so it is safe to await from a task on the owner thread.
    pub fn run_async<R, F>(&self, f: F) -> impl Future<Output = Result<R, Fault>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let operation = "Dispatcher::run_async";
        let (tx, rx) = oneshot::channel();
        let posted = self.try_enqueue(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        }));
        async move {
            if !posted {
                return Err(UsageFault::DispatcherClosed { operation }.into());
            }
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(payload)) => panic::resume_unwind(payload),
                Err(_) => Err(UsageFault::DispatcherClosed { operation }.into()),
            }
        }
    }

    /// Poll `future` to completion on the owner thread. Shutdown waits for it.
    pub fn spawn<F>(&self, future: F) -> Result<(), Fault>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deferral = self.create_deferral()?;
        task::Task::start(self.clone(), Box::pin(future), deferral)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Register an outstanding unit of work that shutdown must wait for.
    pub fn create_deferral(&self) -> Result<Deferral, Fault> {
        let mut state = self.lock();
        if state.shutdown == ShutdownState::Completed {
            return Err(UsageFault::DispatcherClosed {
                operation: "Dispatcher::create_deferral",
            }
            .into());
        }
        state.deferrals += 1;
        Ok(Deferral::new(self.clone()))
    }

    pub(crate) fn release_deferral(&self) {
        let mut state = self.lock();
        state.writer.push(Job::ReleaseDeferral);
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Request shutdown and subscribe `completion` to its end.
    ///
    /// Repeated calls only add subscribers. If shutdown already completed,
    /// `completion` runs immediately on the calling thread.
    pub fn shutdown<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        match state.shutdown {
            ShutdownState::Completed => {
                drop(state);
                completion();
                return;
            }
            ShutdownState::Running => {
                state.shutdown = ShutdownState::Requested;
                tracing::debug!(dispatcher = self.shared.id, "shutdown requested");
            }
            ShutdownState::Requested => {}
        }
        state.completions.push(Box::new(completion));
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Request shutdown and block until it completes. Not callable from the
    /// owner thread, which is the one that has to finish it.
    pub fn shutdown_blocking(&self) -> Result<(), Fault> {
        let operation = "Dispatcher::shutdown_blocking";
        if self.is_owner_thread() {
            return Err(UsageFault::WouldDeadlock { operation }.into());
        }
        let (tx, rx) = mpsc::channel();
        self.shutdown(move || {
            let _ = tx.send(());
        });
        rx.recv()
            .map_err(|_| UsageFault::DispatcherClosed { operation }.into())
    }

    pub fn shutdown_async(&self) -> impl Future<Output = Result<(), Fault>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.shutdown(move || {
            let _ = tx.send(());
        });
        async move {
            rx.await.map_err(|_| {
                UsageFault::DispatcherClosed {
                    operation: "Dispatcher::shutdown_async",
                }
                .into()
            })
        }
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.lock().shutdown
    }

    // ========================================================================
    // Owner loop
    // ========================================================================

    /// Drain work until shutdown completes. Owner thread only.
    pub fn run_loop(&self) -> Result<(), Fault> {
        self.check_owner("Dispatcher::run_loop")?;
        tracing::debug!(dispatcher = self.shared.id, "dispatcher loop started");
        let mut reader = Vec::with_capacity(self.shared.capacity);
        loop {
            let mut state = self.lock();
            loop {
                if !state.writer.is_empty() {
                    std::mem::swap(&mut state.writer, &mut reader);
                    break;
                }
                if state.shutdown == ShutdownState::Completed {
                    return Ok(());
                }
                if let Some(completions) = take_completions(&mut state) {
                    drop(state);
                    self.finish(completions);
                    return Ok(());
                }
                state = self
                    .shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            drop(state);
            self.drain(&mut reader);
        }
    }

    /// Drain the current batch without blocking and finish shutdown if it is
    /// due. For hosts that drive the owner thread themselves.
    pub fn pump(&self) -> Result<usize, Fault> {
        self.check_owner("Dispatcher::pump")?;
        let mut reader = Vec::new();
        {
            let mut state = self.lock();
            std::mem::swap(&mut state.writer, &mut reader);
        }
        let drained = reader.len();
        self.drain(&mut reader);

        let completions = take_completions(&mut self.lock());
        if let Some(completions) = completions {
            self.finish(completions);
        }
        Ok(drained)
    }

    fn drain(&self, reader: &mut Vec<Job>) {
        if reader.is_empty() {
            return;
        }
        let start = Instant::now();
        let items = reader.len();
        tracing::trace!(dispatcher = self.shared.id, items, "draining batch");
        for job in reader.drain(..) {
            match job {
                Job::Run(work) => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                        tracing::error!(
                            dispatcher = self.shared.id,
                            panic = panic_message(&payload),
                            "work item panicked"
                        );
                        metrics! {
                            self.lock().counter.increment("panicked", 1);
                        }
                    }
                }
                Job::ReleaseDeferral => {
                    let mut state = self.lock();
                    state.deferrals = state.deferrals.saturating_sub(1);
                }
            }
        }
        let mut state = self.lock();
        state.timer.record(start.elapsed(), items);
        metrics! {
            state.counter.increment("processed", items);
        }
    }

    fn finish(&self, completions: Vec<Work>) {
        tracing::debug!(
            dispatcher = self.shared.id,
            subscribers = completions.len(),
            "shutdown completed"
        );
        for completion in completions {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(completion)) {
                tracing::error!(
                    dispatcher = self.shared.id,
                    panic = panic_message(&payload),
                    "shutdown subscriber panicked"
                );
            }
        }
        self.shared.wake.notify_all();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn pending(&self) -> usize {
        self.lock().writer.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.lock();
        DispatcherStats {
            state: state.shutdown,
            pending: state.writer.len(),
            deferrals: state.deferrals,
            posted: state.counter.get("posted"),
            processed: state.counter.get("processed"),
            inline: state.counter.get("inline"),
            rejected: state.counter.get("rejected"),
            panicked: state.counter.get("panicked"),
            average_batch_len: state.timer.average_batch_len(),
            average_drain_ms: state.timer.average_drain_ms(),
            drain_range_ms: state.timer.drain_range_ms(),
        }
    }

    fn check_owner(&self, operation: &'static str) -> Result<(), Fault> {
        let current = thread::current().id();
        if current != self.shared.owner {
            return Err(Fault::WrongThread {
                operation,
                owner: self.shared.owner,
                current,
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Flip Requested to Completed once nothing is left to wait for.
fn take_completions(state: &mut QueueState) -> Option<Vec<Work>> {
    if state.shutdown == ShutdownState::Requested
        && state.writer.is_empty()
        && state.deferrals == 0
    {
        state.shutdown = ShutdownState::Completed;
        return Some(std::mem::take(&mut state.completions));
    }
    None
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.shared.id)
            .field("owner", &self.shared.owner)
            .finish()
    }
}
