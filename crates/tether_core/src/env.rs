//! Hosted environments
//!
//! An [`Environment`] ties one engine instance to the one thread allowed to
//! touch it and to the [`Dispatcher`] that thread services. The engine itself
//! never leaves that thread: it lives in a thread-local registry and is looked
//! up by [`EnvId`] after the caller's scope and thread have been validated.

use crate::callback::CallbackTable;
use crate::config::EnvConfig;
use crate::dispatcher::Dispatcher;
use crate::fault::{Fault, UsageFault};
use crate::scope::{Scope, ScopeGuard, ScopeKind};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tether_script::{Engine, EngineError};

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(u64);

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env#{}", self.0)
    }
}

/// Per-environment state that only exists on the engine thread.
pub(crate) struct EnvLocal {
    pub engine: Rc<dyn Engine>,
    pub callbacks: RefCell<CallbackTable>,
    pub root_opened: Cell<bool>,
}

thread_local! {
    static LOCALS: RefCell<HashMap<EnvId, Rc<EnvLocal>>> = RefCell::new(HashMap::new());
}

struct EnvShared {
    id: EnvId,
    dispatcher: Dispatcher,
    config: EnvConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable, thread-safe handle to a hosted environment.
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    /// Bind `engine` to the calling thread and open its Root scope.
    ///
    /// The caller owns the loop: drive it with `dispatcher().pump()` or
    /// `dispatcher().run_loop()`.
    pub fn attach(engine: Rc<dyn Engine>, config: EnvConfig) -> Result<(Environment, ScopeGuard), Fault> {
        let env = Environment {
            shared: Arc::new(EnvShared {
                id: EnvId(NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed)),
                dispatcher: Dispatcher::for_current_thread(config.queue_capacity),
                config,
                thread: Mutex::new(None),
            }),
        };
        LOCALS.with(|locals| {
            locals.borrow_mut().insert(
                env.id(),
                Rc::new(EnvLocal {
                    engine,
                    callbacks: RefCell::new(CallbackTable::new()),
                    root_opened: Cell::new(false),
                }),
            )
        });

        match Scope::open(ScopeKind::Root, &env) {
            Ok(root) => {
                tracing::debug!(env = %env.id(), "environment attached");
                Ok((env, root))
            }
            Err(fault) => {
                env.detach_local();
                Err(fault)
            }
        }
    }

    /// Start a dedicated engine thread, build the engine on it and run the
    /// dispatcher loop there until shutdown.
    pub fn spawn<E, F>(config: EnvConfig, factory: F) -> Result<Environment, Fault>
    where
        E: Engine + 'static,
        F: FnOnce() -> Result<E, EngineError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<Environment, Fault>>();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let engine = match factory() {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = tx.send(Err(Fault::engine("Environment::spawn", err)));
                        return;
                    }
                };
                let (env, root) = match Environment::attach(Rc::new(engine), config) {
                    Ok(pair) => pair,
                    Err(fault) => {
                        let _ = tx.send(Err(fault));
                        return;
                    }
                };
                if tx.send(Ok(env.clone())).is_ok() {
                    if let Err(fault) = env.dispatcher().run_loop() {
                        tracing::error!(%fault, "dispatcher loop failed");
                    }
                }
                if let Err(fault) = root.close() {
                    tracing::error!(%fault, "failed to close root scope");
                }
                env.detach_local();
                tracing::debug!(env = %env.id(), "engine thread exiting");
            })
            .map_err(|err| UsageFault::EnvironmentStartup {
                reason: err.to_string(),
            })?;

        let env = rx.recv().map_err(|_| UsageFault::EnvironmentStartup {
            reason: "engine thread exited during startup".to_string(),
        })??;
        *env.shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(env)
    }

    pub fn id(&self) -> EnvId {
        self.shared.id
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    pub fn is_owner_thread(&self) -> bool {
        self.shared.dispatcher.is_owner_thread()
    }

    /// Run `f` on the engine thread inside a fresh Handle scope and wait for it.
    pub fn run_scoped<R, F>(&self, f: F) -> Result<R, Fault>
    where
        R: Send + 'static,
        F: FnOnce(&Scope) -> Result<R, Fault> + Send + 'static,
    {
        let env = self.clone();
        self.dispatcher()
            .run(true, move || Scope::with(ScopeKind::Handle, &env, f))?
    }

    pub fn collect_garbage(&self) -> Result<(), Fault> {
        let env = self.clone();
        self.dispatcher().run(true, move || {
            env.local("Environment::collect_garbage")
                .map(|local| local.engine.collect_garbage())
        })?
    }

    /// Shut the dispatcher down, wait for it to drain and join the engine
    /// thread if this environment was spawned.
    pub fn shutdown(&self) -> Result<(), Fault> {
        self.dispatcher().shutdown_blocking()?;
        let handle = self
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(env = %self.id(), "engine thread panicked");
            }
        }
        Ok(())
    }

    /// Wrap an engine failure, honouring `capture_engine_stacks`.
    pub(crate) fn engine_fault(&self, operation: &'static str, mut err: EngineError) -> Fault {
        if !self.config().capture_engine_stacks {
            err.stack.clear();
        }
        Fault::engine(operation, err)
    }

    pub(crate) fn local(&self, operation: &'static str) -> Result<Rc<EnvLocal>, Fault> {
        LOCALS
            .with(|locals| locals.borrow().get(&self.id()).cloned())
            .ok_or_else(|| {
                UsageFault::UnknownEnvironment {
                    operation,
                    env: self.id(),
                }
                .into()
            })
    }

    pub(crate) fn detach_local(&self) {
        let removed = LOCALS.with(|locals| locals.borrow_mut().remove(&self.id()));
        // Dropped outside the registry borrow: engine teardown may run host code
        drop(removed);
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Environment {}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.shared.id)
            .field("owner", &self.shared.dispatcher.owner_thread())
            .finish()
    }
}
