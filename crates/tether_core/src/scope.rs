//! Nested lifetime regions
//!
//! Every thread keeps its own stack of open scopes. A scope's parent is
//! whatever was current when it opened, only the opening thread may close it,
//! and closing is strictly LIFO. Values are bound to the scope that was
//! current when they were produced and become unusable the moment it closes.
//!
//! [`Scope`] is a shareable handle (it can be inspected from any thread, which
//! is how off-thread access gets diagnosed). [`ScopeGuard`] is the `!Send`
//! acquisition that closes the scope on every exit path.

use crate::env::Environment;
use crate::fault::{fail_fast, Fault, UsageFault};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tether_script::{Engine, EngineError, RawScope};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Bootstrap only, before any environment exists.
    NoContext,
    /// One per environment; owns environment-wide services.
    Root,
    /// Nested under Root; never inside another Module.
    Module,
    /// Opened around every engine-to-host call.
    Callback,
    /// Batches value creation in a native handle region.
    Handle,
    /// A Handle scope that can hand one value to its parent.
    Escapable,
}

impl ScopeKind {
    fn has_native_region(self) -> bool {
        matches!(self, ScopeKind::Handle | ScopeKind::Escapable)
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeKind::NoContext => "no-context",
            ScopeKind::Root => "root",
            ScopeKind::Module => "module",
            ScopeKind::Callback => "callback",
            ScopeKind::Handle => "handle",
            ScopeKind::Escapable => "escapable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ScopeInner {
    id: ScopeId,
    kind: ScopeKind,
    parent: Option<Scope>,
    owner: ThreadId,
    env: Option<Environment>,
    native: Option<RawScope>,
    open: AtomicBool,
    escaped: AtomicBool,
}

/// Shareable handle to a scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Open a scope of `kind` in `env` and make it current for this thread.
    pub fn open(kind: ScopeKind, env: &Environment) -> Result<ScopeGuard, Fault> {
        if kind == ScopeKind::NoContext {
            return Self::open_no_context();
        }
        let operation = "Scope::open";
        let current = thread::current().id();
        let owner = env.dispatcher().owner_thread();
        if owner != current {
            return Err(Fault::WrongThread {
                operation,
                owner,
                current,
            });
        }
        let local = env.local(operation)?;

        STACK.with(|stack| check_nesting(&stack.borrow(), kind, env))?;
        if kind == ScopeKind::Root {
            if local.root_opened.get() {
                return Err(UsageFault::RootAlreadyOpened { env: env.id() }.into());
            }
            local.root_opened.set(true);
        }

        let native = if kind.has_native_region() {
            let raw = local
                .engine
                .open_handle_scope(kind == ScopeKind::Escapable)
                .map_err(|err| env.engine_fault(operation, err))?;
            Some(raw)
        } else {
            None
        };

        Ok(Self::push(kind, Some(env.clone()), native))
    }

    /// Open the bootstrap scope. Only legal on an empty stack.
    pub fn open_no_context() -> Result<ScopeGuard, Fault> {
        let empty = STACK.with(|stack| stack.borrow().is_empty());
        if !empty {
            return Err(UsageFault::IllegalNesting {
                kind: ScopeKind::NoContext,
                reason: "the bootstrap scope must be the outermost scope",
            }
            .into());
        }
        Ok(Self::push(ScopeKind::NoContext, None, None))
    }

    /// Open a scope, run `f`, and close the scope on every exit path.
    pub fn with<R>(
        kind: ScopeKind,
        env: &Environment,
        f: impl FnOnce(&Scope) -> Result<R, Fault>,
    ) -> Result<R, Fault> {
        let guard = Scope::open(kind, env)?;
        let result = f(guard.scope());
        let closed = guard.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    fn push(kind: ScopeKind, env: Option<Environment>, native: Option<RawScope>) -> ScopeGuard {
        let scope = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let scope = Scope {
                inner: Arc::new(ScopeInner {
                    id: ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)),
                    kind,
                    parent: stack.last().cloned(),
                    owner: thread::current().id(),
                    env,
                    native,
                    open: AtomicBool::new(true),
                    escaped: AtomicBool::new(false),
                }),
            };
            stack.push(scope.clone());
            scope
        });
        tracing::trace!(scope = %scope.id(), kind = %kind, "scope opened");
        ScopeGuard {
            scope,
            armed: true,
            _not_send: PhantomData,
        }
    }

    /// The innermost open scope on this thread.
    pub fn current() -> Option<Scope> {
        STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Number of open scopes on this thread.
    pub fn depth() -> usize {
        STACK.with(|stack| stack.borrow().len())
    }

    /// Close this scope, restoring its parent as current.
    pub fn close(&self) -> Result<(), Fault> {
        let operation = "Scope::close";
        self.check_thread(operation)?;
        if !self.is_open() {
            return Err(UsageFault::ScopeAlreadyClosed { scope: self.id() }.into());
        }

        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let innermost = stack.last().map(Scope::id);
            if innermost != Some(self.id()) {
                return Err(UsageFault::NotInnermost {
                    scope: self.id(),
                    innermost,
                });
            }
            stack.pop();
            Ok(())
        })?;
        self.inner.open.store(false, Ordering::Release);
        tracing::trace!(scope = %self.id(), kind = %self.kind(), "scope closed");

        if let Some(native) = self.inner.native {
            let engine = self.engine(operation)?;
            engine
                .close_handle_scope(native)
                .map_err(|err| self.engine_fault(operation, err))?;
        }
        Ok(())
    }

    /// Re-parent `value` into this scope's parent so it outlives this scope.
    ///
    /// Only Escapable scopes support this, and only once.
    pub fn escape(&self, value: &Value) -> Result<Value, Fault> {
        let operation = "Scope::escape";
        self.validate(operation)?;
        if self.kind() != ScopeKind::Escapable {
            return Err(UsageFault::NotEscapable {
                scope: self.id(),
                kind: self.kind(),
            }
            .into());
        }
        let parent = self.parent().cloned().ok_or(UsageFault::IllegalNesting {
            kind: ScopeKind::Escapable,
            reason: "an escapable scope needs a parent",
        })?;
        if value.is_unbound() {
            return Ok(Value::default());
        }
        match value.scope() {
            Some(owner) if owner.same_as(self) => {}
            _ => return Err(UsageFault::ForeignValue { scope: self.id() }.into()),
        }
        if self.inner.escaped.swap(true, Ordering::AcqRel) {
            return Err(UsageFault::AlreadyEscaped { scope: self.id() }.into());
        }

        let native = self.inner.native.ok_or(UsageFault::NotEscapable {
            scope: self.id(),
            kind: self.kind(),
        })?;
        let engine = self.engine(operation)?;
        let raw = engine
            .escape_handle(native, value.raw())
            .map_err(|err| self.engine_fault(operation, err))?;
        Ok(Value::from_raw(raw, parent))
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.inner.owner
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.inner.env.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Closed first, then thread: the two faults stay distinguishable.
    pub(crate) fn validate(&self, operation: &'static str) -> Result<(), Fault> {
        if !self.is_open() {
            return Err(Fault::ScopeClosed {
                operation,
                scope: self.id(),
                kind: self.kind(),
            });
        }
        self.check_thread(operation)
    }

    fn check_thread(&self, operation: &'static str) -> Result<(), Fault> {
        let current = thread::current().id();
        if current != self.inner.owner {
            return Err(Fault::WrongThread {
                operation,
                owner: self.inner.owner,
                current,
            });
        }
        Ok(())
    }

    fn engine_fault(&self, operation: &'static str, err: EngineError) -> Fault {
        match self.environment() {
            Some(env) => env.engine_fault(operation, err),
            None => Fault::engine(operation, err),
        }
    }

    /// The engine behind this scope. Callers validate first.
    pub(crate) fn engine(&self, operation: &'static str) -> Result<Rc<dyn Engine>, Fault> {
        let env = self.environment().ok_or(UsageFault::NoEnvironment {
            operation,
            scope: self.id(),
        })?;
        Ok(env.local(operation)?.engine.clone())
    }
}

fn check_nesting(stack: &[Scope], kind: ScopeKind, env: &Environment) -> Result<(), Fault> {
    let has_root = stack
        .iter()
        .any(|s| s.kind() == ScopeKind::Root && s.environment() == Some(env));
    let illegal = |reason: &'static str| -> Result<(), Fault> {
        Err(UsageFault::IllegalNesting { kind, reason }.into())
    };
    match kind {
        ScopeKind::NoContext => Ok(()),
        ScopeKind::Root => {
            if stack.iter().any(|s| s.kind() != ScopeKind::NoContext) {
                return illegal("a root scope may only sit on the bootstrap scope");
            }
            Ok(())
        }
        ScopeKind::Module => {
            if !has_root {
                return illegal("the environment's root scope is not open on this thread");
            }
            if stack.iter().any(|s| s.kind() == ScopeKind::Module) {
                return illegal("module scopes cannot nest");
            }
            Ok(())
        }
        ScopeKind::Callback | ScopeKind::Handle | ScopeKind::Escapable => {
            if !has_root {
                return illegal("the environment's root scope is not open on this thread");
            }
            Ok(())
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("open", &self.is_open())
            .field("parent", &self.inner.parent.as_ref().map(Scope::id))
            .finish()
    }
}

/// Scoped acquisition of an open scope. Dropping it closes the scope.
pub struct ScopeGuard {
    scope: Scope,
    armed: bool,
    _not_send: PhantomData<*const ()>,
}

impl ScopeGuard {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Close explicitly and observe the outcome.
    pub fn close(mut self) -> Result<(), Fault> {
        self.armed = false;
        self.scope.close()
    }
}

impl Deref for ScopeGuard {
    type Target = Scope;

    fn deref(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed || !self.scope.is_open() {
            return;
        }
        if let Err(fault) = self.scope.close() {
            if thread::panicking() {
                fail_fast(format!("scope close failed while unwinding: {fault}"));
            }
            tracing::error!(%fault, "scope guard dropped out of order");
        }
    }
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeGuard").field(&self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use tether_script::HeapEngine;

    fn attach() -> (Environment, ScopeGuard, Rc<HeapEngine>) {
        let engine = Rc::new(HeapEngine::new());
        let (env, root) = Environment::attach(engine.clone(), EnvConfig::default()).unwrap();
        (env, root, engine)
    }

    #[test]
    fn test_close_restores_parent() {
        let (env, root, _engine) = attach();
        let outer = Scope::open(ScopeKind::Handle, &env).unwrap();
        let inner = Scope::open(ScopeKind::Escapable, &env).unwrap();
        assert_eq!(inner.parent(), Some(outer.scope()));
        assert_eq!(Scope::current().as_ref(), Some(inner.scope()));

        inner.close().unwrap();
        assert_eq!(Scope::current().as_ref(), Some(outer.scope()));
        outer.close().unwrap();
        assert_eq!(Scope::current().as_ref(), Some(root.scope()));
        root.close().unwrap();
        assert_eq!(Scope::depth(), 0);
    }

    #[test]
    fn test_non_lifo_close_is_a_usage_fault() {
        let (env, _root, _engine) = attach();
        let outer = Scope::open(ScopeKind::Handle, &env).unwrap();
        let inner = Scope::open(ScopeKind::Handle, &env).unwrap();

        let fault = outer.scope().close().unwrap_err();
        assert!(matches!(
            fault.as_usage(),
            Some(UsageFault::NotInnermost { innermost: Some(id), .. }) if *id == inner.id()
        ));
        assert!(outer.is_open());

        inner.close().unwrap();
        outer.close().unwrap();
    }

    #[test]
    fn test_double_close_is_a_usage_fault() {
        let (env, _root, _engine) = attach();
        let guard = Scope::open(ScopeKind::Handle, &env).unwrap();
        let scope = guard.scope().clone();
        guard.close().unwrap();
        assert!(matches!(
            scope.close().unwrap_err().as_usage(),
            Some(UsageFault::ScopeAlreadyClosed { .. })
        ));
    }

    #[test]
    fn test_module_cannot_nest() {
        let (env, _root, _engine) = attach();
        let module = Scope::open(ScopeKind::Module, &env).unwrap();
        let handle = Scope::open(ScopeKind::Handle, &env).unwrap();
        let fault = Scope::open(ScopeKind::Module, &env).unwrap_err();
        assert!(matches!(
            fault.as_usage(),
            Some(UsageFault::IllegalNesting { kind: ScopeKind::Module, .. })
        ));
        // The failed open left the stack untouched
        assert_eq!(Scope::current().as_ref(), Some(handle.scope()));
        handle.close().unwrap();
        module.close().unwrap();
    }

    #[test]
    fn test_root_opens_once_per_environment() {
        let (env, root, _engine) = attach();
        root.close().unwrap();
        let fault = Scope::open(ScopeKind::Root, &env).unwrap_err();
        assert!(matches!(
            fault.as_usage(),
            Some(UsageFault::RootAlreadyOpened { .. })
        ));
    }

    #[test]
    fn test_no_context_only_on_empty_stack() {
        let boot = Scope::open_no_context().unwrap();
        assert!(Scope::open_no_context().is_err());
        let (env, root, _engine) = attach();
        assert_eq!(root.parent(), Some(boot.scope()));
        assert!(Scope::open(ScopeKind::Handle, &env).is_ok());
    }

    #[test]
    fn test_handle_scope_requires_root() {
        let (env, root, _engine) = attach();
        root.close().unwrap();
        let fault = Scope::open(ScopeKind::Handle, &env).unwrap_err();
        assert!(matches!(
            fault.as_usage(),
            Some(UsageFault::IllegalNesting { kind: ScopeKind::Handle, .. })
        ));
    }

    #[test]
    fn test_handle_scope_releases_native_handles() {
        let (env, _root, engine) = attach();
        let before = engine.live_handles();
        let guard = Scope::open(ScopeKind::Handle, &env).unwrap();
        Value::object().unwrap();
        Value::string("temp").unwrap();
        assert_eq!(engine.live_handles(), before + 2);
        drop(guard);
        assert_eq!(engine.live_handles(), before);
        assert_eq!(engine.open_handle_scopes(), 0);
    }

    #[test]
    fn test_close_from_foreign_thread_is_wrong_thread() {
        let (env, _root, _engine) = attach();
        let guard = Scope::open(ScopeKind::Handle, &env).unwrap();
        let scope = guard.scope().clone();
        let fault = std::thread::spawn(move || scope.close().unwrap_err())
            .join()
            .unwrap();
        assert!(fault.is_wrong_thread());
        assert!(guard.is_open());
    }

    #[test]
    fn test_escape_rules() {
        let (env, _root, _engine) = attach();
        let handle = Scope::open(ScopeKind::Handle, &env).unwrap();
        let plain = Value::number(1.0).unwrap();
        assert!(matches!(
            handle.escape(&plain).unwrap_err().as_usage(),
            Some(UsageFault::NotEscapable { .. })
        ));

        let escapable = Scope::open(ScopeKind::Escapable, &env).unwrap();
        assert!(matches!(
            escapable.escape(&plain).unwrap_err().as_usage(),
            Some(UsageFault::ForeignValue { .. })
        ));
        let inner = Value::number(2.0).unwrap();
        let escaped = escapable.escape(&inner).unwrap();
        assert!(matches!(
            escapable.escape(&inner).unwrap_err().as_usage(),
            Some(UsageFault::AlreadyEscaped { .. })
        ));
        escapable.close().unwrap();
        assert_eq!(escaped.scope(), Some(handle.scope()));
        assert_eq!(escaped.as_f64().unwrap(), 2.0);
    }

    #[test]
    fn test_region_failures_honour_stack_capture_setting() {
        let config = EnvConfig {
            capture_engine_stacks: false,
            ..EnvConfig::default()
        };
        let (env, _root) = Environment::attach(Rc::new(HeapEngine::new()), config).unwrap();
        let guard = Scope::open(ScopeKind::Handle, &env).unwrap();
        let err = EngineError::new(tether_script::EngineStatus::HandleScopeMismatch, "mismatch")
            .with_stack(vec![tether_script::EngineFrame::native("inner")]);

        let fault = guard.scope().engine_fault("Scope::close", err);
        let engine = fault.as_engine().expect("engine fault");
        assert!(engine.engine_stack.is_empty());
    }
}
