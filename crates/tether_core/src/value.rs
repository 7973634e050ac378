//! Scope-bound engine values
//!
//! A [`Value`] pairs an opaque engine handle with the scope that was current
//! when it was produced. Every operation funnels through one check: the owning
//! scope must still be open and the caller must be on its thread. Only then is
//! the engine looked up and touched. Results bind to the caller's current
//! scope.
//!
//! `Value::default()` is unbound: it reads as `undefined` without needing a
//! scope, and is what missing callback arguments and collected weak targets
//! fall back to.

use crate::callback::{CallbackArgs, HostFunction, Trampoline};
use crate::env::Environment;
use crate::fault::{Fault, UsageFault};
use crate::scope::Scope;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tether_script::{CallbackHost, Engine, EngineError, EngineResult, RawValue, ValueKind};

#[derive(Clone, Default)]
pub struct Value {
    raw: RawValue,
    scope: Option<Scope>,
}

impl Value {
    pub(crate) fn from_raw(raw: RawValue, scope: Scope) -> Self {
        Self {
            raw,
            scope: Some(scope),
        }
    }

    pub fn raw(&self) -> RawValue {
        self.raw
    }

    /// Owning scope, `None` for an unbound value.
    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn is_unbound(&self) -> bool {
        self.scope.is_none()
    }

    // ========================================================================
    // Choke point
    // ========================================================================

    /// Validate the owning scope, then run `f` against its engine. Unbound
    /// values run against the current scope.
    pub(crate) fn with_engine<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn Engine, &Scope) -> Result<R, Fault>,
    ) -> Result<R, Fault> {
        let scope = match &self.scope {
            Some(scope) => scope.clone(),
            None => current_scope(operation)?,
        };
        scope.validate(operation)?;
        let engine = scope.engine(operation)?;
        f(engine.as_ref(), &scope)
    }

    /// Construct a value in the current scope.
    fn construct(
        operation: &'static str,
        f: impl FnOnce(&dyn Engine) -> EngineResult<RawValue>,
    ) -> Result<Value, Fault> {
        let scope = current_scope(operation)?;
        scope.validate(operation)?;
        let engine = scope.engine(operation)?;
        let raw = f(engine.as_ref()).map_err(|err| engine_fault(operation, &scope, err))?;
        Ok(Value::from_raw(raw, scope))
    }

    /// Raw handle of a value passed into an operation on `env`, after the
    /// same scope and thread checks the receiver went through.
    pub(crate) fn checked_raw(&self, operation: &'static str, env: &Environment) -> Result<RawValue, Fault> {
        let Some(scope) = &self.scope else {
            return Ok(RawValue::UNDEFINED);
        };
        scope.validate(operation)?;
        if scope.environment() != Some(env) {
            return Err(UsageFault::ForeignEnvironment { operation }.into());
        }
        Ok(self.raw)
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn undefined() -> Result<Value, Fault> {
        Self::construct("Value::undefined", |_| Ok(RawValue::UNDEFINED))
    }

    pub fn null() -> Result<Value, Fault> {
        Self::construct("Value::null", |engine| engine.null())
    }

    pub fn boolean(value: bool) -> Result<Value, Fault> {
        Self::construct("Value::boolean", |engine| engine.boolean(value))
    }

    pub fn number(value: f64) -> Result<Value, Fault> {
        Self::construct("Value::number", |engine| engine.number(value))
    }

    pub fn string(value: &str) -> Result<Value, Fault> {
        Self::construct("Value::string", |engine| engine.string(value))
    }

    pub fn object() -> Result<Value, Fault> {
        Self::construct("Value::object", |engine| engine.object())
    }

    pub fn array() -> Result<Value, Fault> {
        Self::construct("Value::array", |engine| engine.array())
    }

    /// An engine error object carrying `message`.
    pub fn error(message: &str) -> Result<Value, Fault> {
        Self::construct("Value::error", |engine| engine.error(message))
    }

    pub fn global() -> Result<Value, Fault> {
        Self::construct("Value::global", |engine| engine.global())
    }

    /// A script-callable function backed by the host closure `f`.
    ///
    /// `f` runs on the engine thread inside its own Callback scope. The
    /// registration lives as long as the environment.
    pub fn function<F>(name: &str, f: F) -> Result<Value, Fault>
    where
        F: Fn(&CallbackArgs) -> Result<Value, Fault> + 'static,
    {
        let operation = "Value::function";
        let scope = current_scope(operation)?;
        scope.validate(operation)?;
        let env = scope.environment().ok_or(UsageFault::NoEnvironment {
            operation,
            scope: scope.id(),
        })?;
        let local = env.local(operation)?;
        let function: Rc<HostFunction> = Rc::new(f);
        let token = local.callbacks.borrow_mut().register(function);
        tracing::trace!(
            name,
            token = token.0,
            registered = local.callbacks.borrow().len(),
            "host function registered"
        );
        let raw = local
            .engine
            .function(name, token)
            .map_err(|err| engine_fault(operation, &scope, err))?;
        Ok(Value::from_raw(raw, scope))
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn kind(&self) -> Result<ValueKind, Fault> {
        if self.is_unbound() {
            return Ok(ValueKind::Undefined);
        }
        self.engine_op("Value::kind", |engine| engine.type_of(self.raw))
    }

    pub fn is_undefined(&self) -> Result<bool, Fault> {
        Ok(self.kind()? == ValueKind::Undefined)
    }

    pub fn is_null(&self) -> Result<bool, Fault> {
        Ok(self.kind()? == ValueKind::Null)
    }

    pub fn is_function(&self) -> Result<bool, Fault> {
        Ok(self.kind()? == ValueKind::Function)
    }

    pub fn is_object(&self) -> Result<bool, Fault> {
        Ok(matches!(self.kind()?, ValueKind::Object | ValueKind::Function))
    }

    pub fn is_array(&self) -> Result<bool, Fault> {
        if self.is_unbound() {
            return Ok(false);
        }
        self.engine_op("Value::is_array", |engine| engine.is_array(self.raw))
    }

    /// Engine strict equality (`===`).
    pub fn strict_equals(&self, other: &Value) -> Result<bool, Fault> {
        if self.is_unbound() && other.is_unbound() {
            return Ok(true);
        }
        let operation = "Value::strict_equals";
        self.with_engine(operation, |engine, scope| {
            let env = scope_env(operation, scope)?;
            let other = other.checked_raw(operation, env)?;
            engine
                .strict_equals(self.raw, other)
                .map_err(|err| engine_fault(operation, scope, err))
        })
    }

    // ========================================================================
    // Properties and elements
    // ========================================================================

    pub fn get(&self, key: &str) -> Result<Value, Fault> {
        self.produce("Value::get", |engine| engine.get_named_property(self.raw, key))
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<(), Fault> {
        let operation = "Value::set";
        self.with_engine(operation, |engine, scope| {
            let value = value.checked_raw(operation, scope_env(operation, scope)?)?;
            engine
                .set_named_property(self.raw, key, value)
                .map_err(|err| engine_fault(operation, scope, err))
        })
    }

    pub fn has(&self, key: &str) -> Result<bool, Fault> {
        self.engine_op("Value::has", |engine| engine.has_named_property(self.raw, key))
    }

    pub fn delete(&self, key: &str) -> Result<bool, Fault> {
        self.engine_op("Value::delete", |engine| {
            engine.delete_named_property(self.raw, key)
        })
    }

    pub fn get_index(&self, index: u32) -> Result<Value, Fault> {
        self.produce("Value::get_index", |engine| engine.get_element(self.raw, index))
    }

    pub fn set_index(&self, index: u32, value: &Value) -> Result<(), Fault> {
        let operation = "Value::set_index";
        self.with_engine(operation, |engine, scope| {
            let value = value.checked_raw(operation, scope_env(operation, scope)?)?;
            engine
                .set_element(self.raw, index, value)
                .map_err(|err| engine_fault(operation, scope, err))
        })
    }

    /// Array length.
    pub fn len(&self) -> Result<u32, Fault> {
        self.engine_op("Value::len", |engine| engine.array_length(self.raw))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call this function with receiver `this`.
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, Fault> {
        let operation = "Value::call";
        self.with_engine(operation, |engine, scope| {
            let env = scope_env(operation, scope)?;
            let this = this.checked_raw(operation, env)?;
            let args = args
                .iter()
                .map(|arg| arg.checked_raw(operation, env))
                .collect::<Result<Vec<_>, _>>()?;
            let host: Rc<dyn CallbackHost> = Rc::new(Trampoline { env: env.clone() });
            let raw = engine
                .call_function(host, self.raw, this, &args)
                .map_err(|err| engine_fault(operation, scope, err))?;
            Ok(Value::from_raw(raw, current_scope(operation)?))
        })
    }

    /// Look up `name` on this value and call it with this value as receiver.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, Fault> {
        self.get(name)?.call(self, args)
    }

    // ========================================================================
    // Coercion and extraction
    // ========================================================================

    /// Engine `String(value)`.
    pub fn to_string_coerced(&self) -> Result<String, Fault> {
        if self.is_unbound() {
            return Ok("undefined".to_string());
        }
        self.engine_op("Value::to_string_coerced", |engine| {
            engine.coerce_to_string(self.raw)
        })
    }

    pub fn to_number_coerced(&self) -> Result<f64, Fault> {
        if self.is_unbound() {
            return Ok(f64::NAN);
        }
        self.engine_op("Value::to_number_coerced", |engine| {
            engine.coerce_to_number(self.raw)
        })
    }

    pub fn to_bool_coerced(&self) -> Result<bool, Fault> {
        if self.is_unbound() {
            return Ok(false);
        }
        self.engine_op("Value::to_bool_coerced", |engine| {
            engine.coerce_to_bool(self.raw)
        })
    }

    /// The string, if this is a string. No coercion.
    pub fn as_string(&self) -> Result<String, Fault> {
        self.engine_op("Value::as_string", |engine| engine.get_value_string(self.raw))
    }

    pub fn as_f64(&self) -> Result<f64, Fault> {
        self.engine_op("Value::as_f64", |engine| engine.get_value_f64(self.raw))
    }

    pub fn as_bool(&self) -> Result<bool, Fault> {
        self.engine_op("Value::as_bool", |engine| engine.get_value_bool(self.raw))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn engine_op<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn Engine) -> EngineResult<R>,
    ) -> Result<R, Fault> {
        self.with_engine(operation, |engine, scope| {
            f(engine).map_err(|err| engine_fault(operation, scope, err))
        })
    }

    fn produce(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn Engine) -> EngineResult<RawValue>,
    ) -> Result<Value, Fault> {
        let raw = self.engine_op(operation, f)?;
        Ok(Value::from_raw(raw, current_scope(operation)?))
    }
}

pub(crate) fn current_scope(operation: &'static str) -> Result<Scope, Fault> {
    Scope::current().ok_or_else(|| UsageFault::NoCurrentScope { operation }.into())
}

pub(crate) fn scope_env<'a>(operation: &'static str, scope: &'a Scope) -> Result<&'a Environment, Fault> {
    scope.environment().ok_or_else(|| {
        UsageFault::NoEnvironment {
            operation,
            scope: scope.id(),
        }
        .into()
    })
}

pub(crate) fn engine_fault(operation: &'static str, scope: &Scope, err: EngineError) -> Fault {
    match scope.environment() {
        Some(env) => env.engine_fault(operation, err),
        None => Fault::engine(operation, err),
    }
}

/// Engine strict equality. Panics if either side cannot be read, since
/// `PartialEq` has no way to report the fault.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match self.strict_equals(other) {
            Ok(equal) => equal,
            Err(fault) => panic!("Value comparison failed: {fault}"),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, _state: &mut H) {
        panic!("Value has no stable identity to hash; key by Reference instead");
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("raw", &self.raw)
            .field("scope", &self.scope.as_ref().map(Scope::id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::scope::{ScopeGuard, ScopeKind};
    use tether_script::HeapEngine;

    fn attach() -> (Environment, ScopeGuard) {
        Environment::attach(Rc::new(HeapEngine::new()), EnvConfig::default()).unwrap()
    }

    #[test]
    fn test_unbound_value_reads_as_undefined() {
        let value = Value::default();
        assert_eq!(value.kind().unwrap(), ValueKind::Undefined);
        assert_eq!(value.to_string_coerced().unwrap(), "undefined");
        assert!(!value.to_bool_coerced().unwrap());
        assert!(value.to_number_coerced().unwrap().is_nan());
        assert!(!value.is_array().unwrap());
    }

    #[test]
    fn test_operations_on_closed_scope_fault() {
        let (env, _root) = attach();
        let guard = Scope::open(ScopeKind::Handle, &env).unwrap();
        let obj = Value::object().unwrap();
        let key = Value::string("k").unwrap();
        guard.close().unwrap();

        assert!(obj.kind().unwrap_err().is_scope_closed());
        assert!(obj.get("k").unwrap_err().is_scope_closed());
        assert!(obj.set("k", &Value::default()).unwrap_err().is_scope_closed());
        assert!(key.as_string().unwrap_err().is_scope_closed());
        assert!(key.to_string_coerced().unwrap_err().is_scope_closed());
    }

    #[test]
    fn test_closed_argument_faults_too() {
        let (env, _root) = attach();
        let obj = Value::object().unwrap();
        let stale = Scope::with(ScopeKind::Handle, &env, |_| Value::number(1.0)).unwrap();
        let fault = obj.set("n", &stale).unwrap_err();
        assert!(fault.is_scope_closed());
    }

    #[test]
    fn test_properties_and_elements() {
        let (_env, _root) = attach();
        let obj = Value::object().unwrap();
        obj.set("name", &Value::string("tether").unwrap()).unwrap();
        assert!(obj.has("name").unwrap());
        assert_eq!(obj.get("name").unwrap().as_string().unwrap(), "tether");
        assert!(obj.delete("name").unwrap());
        assert!(obj.get("name").unwrap().is_undefined().unwrap());

        let list = Value::array().unwrap();
        list.set_index(0, &Value::number(1.5).unwrap()).unwrap();
        list.set_index(2, &Value::boolean(true).unwrap()).unwrap();
        assert!(list.is_array().unwrap());
        assert_eq!(list.len().unwrap(), 3);
        assert!(list.get_index(2).unwrap().as_bool().unwrap());
        assert!(list.get_index(1).unwrap().is_undefined().unwrap());
    }

    #[test]
    fn test_strict_equality() {
        let (_env, _root) = attach();
        let a = Value::object().unwrap();
        let b = Value::object().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(Value::number(2.0).unwrap(), Value::number(2.0).unwrap());
        assert_ne!(Value::number(2.0).unwrap(), Value::string("2").unwrap());
    }

    #[test]
    fn test_coercion() {
        let (_env, _root) = attach();
        assert_eq!(Value::number(4.0).unwrap().to_string_coerced().unwrap(), "4");
        assert_eq!(Value::string("12").unwrap().to_number_coerced().unwrap(), 12.0);
        assert!(Value::string("x").unwrap().to_bool_coerced().unwrap());
        assert!(!Value::null().unwrap().to_bool_coerced().unwrap());
        let fault = Value::string("x").unwrap().as_f64().unwrap_err();
        assert!(fault.as_engine().is_some());
    }

    #[test]
    fn test_off_thread_use_is_wrong_thread() {
        let (_env, _root) = attach();
        let obj = Value::object().unwrap();
        let fault = std::thread::spawn(move || obj.get("x").unwrap_err())
            .join()
            .unwrap();
        assert!(fault.is_wrong_thread());
    }

    #[test]
    fn test_engine_stack_can_be_dropped() {
        let config = EnvConfig {
            capture_engine_stacks: false,
            ..EnvConfig::default()
        };
        let (_env, _root) = Environment::attach(Rc::new(HeapEngine::new()), config).unwrap();
        let thrower = Value::function("thrower", |_| {
            Err(UsageFault::NoCurrentScope { operation: "thrower" }.into())
        })
        .unwrap();
        let fault = thrower.call(&Value::default(), &[]).unwrap_err();
        assert!(fault.as_engine().unwrap().engine_stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "key by Reference")]
    fn test_hash_steers_to_reference() {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        Value::default().hash(&mut hasher);
    }
}
