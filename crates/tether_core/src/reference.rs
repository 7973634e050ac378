//! Persistent references
//!
//! A [`Reference`] keeps an engine value reachable (strong) or merely
//! observable (weak) independently of any scope. It may be held and used from
//! any thread; every engine interaction is funneled to the environment's
//! owner thread through its dispatcher, and all state transitions happen
//! there.

use crate::env::Environment;
use crate::fault::{fail_fast, Fault, UsageFault};
use crate::scope::{Scope, ScopeKind};
use crate::value::{current_scope, engine_fault, scope_env, Value};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tether_script::{Engine, RawRef};

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

struct RefState {
    weak: bool,
    disposed: bool,
}

struct RefInner {
    id: u64,
    raw: RawRef,
    env: Environment,
    state: Mutex<RefState>,
}

impl RefInner {
    fn lock(&self) -> MutexGuard<'_, RefState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_live(&self, operation: &'static str) -> Result<(), Fault> {
        if self.lock().disposed {
            return Err(UsageFault::ReferenceDisposed {
                operation,
                reference: self.id,
            }
            .into());
        }
        Ok(())
    }

    fn engine_fault(&self, operation: &'static str, err: tether_script::EngineError) -> Fault {
        self.env.engine_fault(operation, err)
    }
}

/// Persistent handle to an engine value. Identity (`Eq`, `Hash`) is the
/// handle itself, not the value it points at.
pub struct Reference {
    inner: Arc<RefInner>,
}

impl Reference {
    /// Create a reference to `value`. Its scope must be open and current
    /// thread must own it.
    pub fn new(value: &Value, weak: bool) -> Result<Reference, Fault> {
        let operation = "Reference::new";
        value.with_engine(operation, |engine, scope| {
            let env = scope_env(operation, scope)?.clone();
            let initial_count = if weak { 0 } else { 1 };
            let raw = engine
                .create_reference(value.raw(), initial_count)
                .map_err(|err| engine_fault(operation, scope, err))?;
            let id = NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(reference = id, weak, env = %env.id(), "reference created");
            Ok(Reference {
                inner: Arc::new(RefInner {
                    id,
                    raw,
                    env,
                    state: Mutex::new(RefState {
                        weak,
                        disposed: false,
                    }),
                }),
            })
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.env
    }

    pub fn is_weak(&self) -> bool {
        self.inner.lock().weak
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Run `f` on the owner thread, inline when already there.
    fn on_owner<R, F>(&self, operation: &'static str, f: F) -> Result<R, Fault>
    where
        R: Send + 'static,
        F: FnOnce(&RefInner, &dyn Engine) -> Result<R, Fault> + Send + 'static,
    {
        self.inner.check_live(operation)?;
        let inner = self.inner.clone();
        self.inner.env.dispatcher().run(true, move || {
            inner.check_live(operation)?;
            let local = inner.env.local(operation)?;
            f(&inner, local.engine.as_ref())
        })?
    }

    /// A fresh value for the target. `None` once a weak target has been
    /// collected.
    ///
    /// On the owner thread the value is bound to the current scope. From any
    /// other thread the target is resolved inside a Handle scope on the owner
    /// thread that closes before this returns, so the value only reports
    /// liveness; use [`Reference::run`] to work with it.
    pub fn resolve(&self) -> Result<Option<Value>, Fault> {
        let operation = "Reference::resolve";
        if !self.inner.env.is_owner_thread() {
            self.inner.check_live(operation)?;
            let inner = self.inner.clone();
            return self.inner.env.dispatcher().run(true, move || {
                inner.check_live(operation)?;
                Scope::with(ScopeKind::Handle, &inner.env, |scope| {
                    let engine = scope.engine(operation)?;
                    let raw = engine
                        .reference_value(inner.raw)
                        .map_err(|err| inner.engine_fault(operation, err))?;
                    Ok(raw.map(|raw| Value::from_raw(raw, scope.clone())))
                })
            })?;
        }
        self.on_owner(operation, move |inner, engine| {
            let scope = current_scope(operation)?;
            scope.validate(operation)?;
            let raw = engine
                .reference_value(inner.raw)
                .map_err(|err| inner.engine_fault(operation, err))?;
            Ok(raw.map(|raw| Value::from_raw(raw, scope)))
        })
    }

    /// Stop keeping the target alive. No-op if already weak.
    pub fn make_weak(&self) -> Result<(), Fault> {
        let operation = "Reference::make_weak";
        self.on_owner(operation, move |inner, engine| {
            let mut state = inner.lock();
            if !state.weak {
                engine
                    .reference_unref(inner.raw)
                    .map_err(|err| inner.engine_fault(operation, err))?;
                state.weak = true;
            }
            Ok(())
        })
    }

    /// Keep the target alive again. No-op if already strong.
    pub fn make_strong(&self) -> Result<(), Fault> {
        let operation = "Reference::make_strong";
        self.on_owner(operation, move |inner, engine| {
            let mut state = inner.lock();
            if state.weak {
                engine
                    .reference_ref(inner.raw)
                    .map_err(|err| inner.engine_fault(operation, err))?;
                state.weak = false;
            }
            Ok(())
        })
    }

    /// Resolve inside a fresh Handle scope on the owner thread and hand the
    /// value to `f`. Blocks until `f` returns; `None` if the target is gone.
    pub fn run<R, F>(&self, f: F) -> Result<Option<R>, Fault>
    where
        R: Send + 'static,
        F: FnOnce(&Value) -> Result<R, Fault> + Send + 'static,
    {
        let operation = "Reference::run";
        self.inner.check_live(operation)?;
        let inner = self.inner.clone();
        self.inner
            .env
            .dispatcher()
            .run(true, move || run_in_handle_scope(&inner, operation, f))?
    }

    /// Like [`Reference::run`], but queued and awaited instead of blocking.
    pub fn run_async<R, F>(&self, f: F) -> impl Future<Output = Result<Option<R>, Fault>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce(&Value) -> Result<R, Fault> + Send + 'static,
    {
        let operation = "Reference::run_async";
        let live = self.inner.check_live(operation);
        let inner = self.inner.clone();
        let pending = self
            .inner
            .env
            .dispatcher()
            .run_async(move || run_in_handle_scope(&inner, operation, f));
        async move {
            live?;
            pending.await?
        }
    }

    /// Release the engine reference. Inline on the owner thread, queued from
    /// anywhere else. Disposing twice is a usage fault.
    pub fn dispose(&self) -> Result<(), Fault> {
        {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(UsageFault::DoubleDispose {
                    reference: self.inner.id,
                }
                .into());
            }
            state.disposed = true;
        }
        if self.inner.env.is_owner_thread() {
            return release(&self.inner.env, self.inner.raw, self.inner.id);
        }
        let (env, raw, id) = (self.inner.env.clone(), self.inner.raw, self.inner.id);
        let queued = self.inner.env.dispatcher().try_enqueue(Box::new(move || {
            if let Err(fault) = release(&env, raw, id) {
                tracing::warn!(reference = id, %fault, "queued dispose failed");
            }
        }));
        if !queued {
            tracing::warn!(reference = id, "dispatcher closed before reference could be disposed");
        }
        Ok(())
    }
}

fn run_in_handle_scope<R, F>(inner: &RefInner, operation: &'static str, f: F) -> Result<Option<R>, Fault>
where
    F: FnOnce(&Value) -> Result<R, Fault>,
{
    inner.check_live(operation)?;
    Scope::with(ScopeKind::Handle, &inner.env, |scope| {
        let engine = scope.engine(operation)?;
        let raw = engine
            .reference_value(inner.raw)
            .map_err(|err| inner.engine_fault(operation, err))?;
        match raw {
            Some(raw) => f(&Value::from_raw(raw, scope.clone())).map(Some),
            None => Ok(None),
        }
    })
}

fn release(env: &Environment, raw: RawRef, id: u64) -> Result<(), Fault> {
    let operation = "Reference::dispose";
    let local = env.local(operation)?;
    local
        .engine
        .delete_reference(raw)
        .map_err(|err| env.engine_fault(operation, err))?;
    tracing::trace!(reference = id, "reference released");
    Ok(())
}

impl Drop for Reference {
    fn drop(&mut self) {
        let already = std::mem::replace(&mut self.inner.lock().disposed, true);
        if already {
            return;
        }
        let (env, raw, id) = (self.inner.env.clone(), self.inner.raw, self.inner.id);
        let cleanup = Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| release(&env, raw, id))) {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => {
                    tracing::warn!(reference = id, %fault, "reference cleanup failed");
                }
                Err(_) => fail_fast(format!("panic while releasing reference {id}")),
            }
        });
        // No inline cleanup while unwinding: it must not run engine code then
        let allow_sync = !thread::panicking();
        if !self.inner.env.dispatcher().post(cleanup, allow_sync) {
            tracing::debug!(reference = id, "dispatcher closed, reference dropped without release");
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Reference")
            .field("id", &self.inner.id)
            .field("env", &self.inner.env.id())
            .field("weak", &state.weak)
            .field("disposed", &state.disposed)
            .finish()
    }
}
