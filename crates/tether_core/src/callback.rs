//! Engine-to-host calls
//!
//! Host functions are registered per environment and handed to the engine as
//! opaque [`CallbackToken`]s. When script calls one, the engine goes through
//! the [`Trampoline`], which opens a Callback scope, runs the host function
//! and closes the scope again on every exit path.

use crate::env::Environment;
use crate::fault::{fail_fast, Fault, FaultHandling};
use crate::scope::{Scope, ScopeKind};
use crate::value::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tether_script::{CallbackHost, CallbackToken, EngineError, EngineResult, EngineStatus, RawValue};

pub(crate) type HostFunction = dyn Fn(&CallbackArgs) -> Result<Value, Fault>;

/// Host functions registered with one environment.
pub(crate) struct CallbackTable {
    next: u64,
    entries: HashMap<u64, Rc<HostFunction>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, function: Rc<HostFunction>) -> CallbackToken {
        let token = self.next;
        self.next += 1;
        self.entries.insert(token, function);
        CallbackToken(token)
    }

    pub fn get(&self, token: CallbackToken) -> Option<Rc<HostFunction>> {
        self.entries.get(&token.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver and arguments of one engine-to-host call, bound to its Callback
/// scope.
pub struct CallbackArgs {
    this: Value,
    args: Vec<Value>,
    scope: Scope,
}

impl CallbackArgs {
    pub fn this(&self) -> &Value {
        &self.this
    }

    /// Argument `index`, or undefined when the caller passed fewer.
    pub fn get(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The Callback scope this call runs in.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

pub(crate) struct Trampoline {
    pub env: Environment,
}

impl Trampoline {
    fn dispatch(&self, token: CallbackToken, this: RawValue, args: &[RawValue]) -> Result<RawValue, Fault> {
        let operation = "host callback";
        // Cloned out so the table is not borrowed while the callback runs
        let callback = self
            .env
            .local(operation)?
            .callbacks
            .borrow()
            .get(token)
            .ok_or(crate::fault::UsageFault::UnknownCallback { token: token.0 })?;

        let guard = Scope::open(ScopeKind::Callback, &self.env)?;
        let scope = guard.scope().clone();
        let call = CallbackArgs {
            this: Value::from_raw(this, scope.clone()),
            args: args
                .iter()
                .map(|raw| Value::from_raw(*raw, scope.clone()))
                .collect(),
            scope,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&call)));
        let result = match outcome {
            Ok(Ok(value)) => value.checked_raw(operation, &self.env),
            Ok(Err(fault)) => Err(fault),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(token = token.0, %message, "host callback panicked");
                Err(Fault::engine(
                    operation,
                    EngineError::new(
                        EngineStatus::GenericFailure,
                        format!("host callback panicked: {message}"),
                    ),
                ))
            }
        };
        drop(call);
        match result {
            Ok(raw) => {
                guard.close()?;
                Ok(raw)
            }
            Err(fault) => {
                let _handling = FaultHandling::enter("host callback fault");
                if let Err(close_fault) = guard.close() {
                    fail_fast(format!(
                        "callback scope failed to close while unwinding `{fault}`: {close_fault}"
                    ));
                }
                Err(fault)
            }
        }
    }
}

impl CallbackHost for Trampoline {
    fn invoke(&self, token: CallbackToken, this: RawValue, args: &[RawValue]) -> EngineResult<RawValue> {
        self.dispatch(token, this, args)
            .map_err(Fault::into_engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::fault::UsageFault;
    use tether_script::HeapEngine;

    #[test]
    fn test_callback_runs_in_its_own_scope() {
        let (_env, root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
        let seen = Rc::new(std::cell::RefCell::new(None));
        let record = seen.clone();
        let sum = Value::function("sum", move |args| {
            *record.borrow_mut() = Some((args.scope().kind(), Scope::depth()));
            let a = args.get(0).as_f64()?;
            let b = args.get(1).as_f64()?;
            Value::number(a + b)
        })
        .unwrap();

        let depth = Scope::depth();
        let result = sum
            .call(&Value::undefined().unwrap(), &[Value::number(2.0).unwrap(), Value::number(3.0).unwrap()])
            .unwrap();
        assert_eq!(result.as_f64().unwrap(), 5.0);
        assert_eq!(result.scope(), Some(root.scope()));
        assert_eq!(*seen.borrow(), Some((ScopeKind::Callback, depth + 1)));
        assert_eq!(Scope::depth(), depth);
    }

    #[test]
    fn test_missing_arguments_read_as_undefined() {
        let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
        let arity = Value::function("arity", |args| {
            assert!(args.get(3).is_undefined()?);
            Value::number(args.len() as f64)
        })
        .unwrap();
        let result = arity.call(&Value::default(), &[Value::null().unwrap()]).unwrap();
        assert_eq!(result.as_f64().unwrap(), 1.0);
    }

    #[test]
    fn test_callback_fault_crosses_back_as_cause() {
        let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
        let failing = Value::function("failing", |_| {
            Err(UsageFault::NoCurrentScope { operation: "inside" }.into())
        })
        .unwrap();
        let fault = failing.call(&Value::default(), &[]).unwrap_err();
        let engine = fault.as_engine().expect("engine fault");
        let cause = engine.cause.as_ref().expect("host cause");
        let inner = cause.downcast_ref::<Fault>().expect("fault cause");
        assert!(matches!(inner.as_usage(), Some(UsageFault::NoCurrentScope { .. })));
    }

    #[test]
    fn test_callback_panic_becomes_engine_fault() {
        let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap();
        let depth = Scope::depth();
        let panicking = Value::function("panicking", |_| panic!("callback blew up")).unwrap();
        let fault = panicking.call(&Value::default(), &[]).unwrap_err();
        assert!(fault.to_string().contains("callback blew up"));
        assert_eq!(Scope::depth(), depth);
    }

    #[test]
    fn test_table_tokens_are_unique() {
        let mut table = CallbackTable::new();
        let a = table.register(Rc::new(|_: &CallbackArgs| Ok::<_, Fault>(Value::default())));
        let b = table.register(Rc::new(|_: &CallbackArgs| Ok::<_, Fault>(Value::default())));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.get(CallbackToken(99)).is_none());
    }
}
