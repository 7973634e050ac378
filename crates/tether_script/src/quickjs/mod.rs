//! QuickJS-backed engine
//!
//! [`QuickJsEngine`] drives an rquickjs runtime through the handle-based
//! [`Engine`] surface. Values live in the JS heap; the handles the bridge sees
//! are slots holding `Persistent` values, grouped into regions that release
//! their slots on close. A weak reference holds a JS `WeakRef`, so the
//! collector is free to reclaim its target.
//!
//! rquickjs only hands out a `Ctx` inside `Context::with`, which must not be
//! re-entered. The outermost engine call opens it; every call made while it
//! is open (a host callback building values or calling back into script)
//! reuses that context.

mod handles;

use crate::engine::{
    CallbackHost, CallbackToken, Engine, EngineError, EngineFrame, EngineResult, EngineStatus,
    RawRef, RawScope, RawValue, SourceLocation, ValueKind,
};
use handles::{HandleTable, Slot};
use rquickjs::function::{IntoArgs, Rest, This};
use rquickjs::{
    qjs, Array, Context, Ctx, FromJs, Function, Object, Persistent, Runtime, Type,
    Value as JsValue,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

/// Script-side helpers, compiled once per engine.
const INTRINSICS: &str = r#"({
    get: (target, key) => target[key],
    set: (target, key, value) => { target[key] = value; },
    same: (a, b) => a === b,
    string: (value) => String(value),
    number: (value) => Number(value),
    truthy: (value) => !!value,
    weak: (target) => new WeakRef(target),
    deref: (weak) => weak.deref(),
})"#;

/// Marks an exception thrown on behalf of a host error.
const THROWN_KEY: &str = "__tether_thrown";

enum Held {
    Strong(Slot),
    /// The slot holds a `WeakRef` to the target.
    Weak(Slot),
}

struct RefEntry {
    held: Held,
    count: u32,
}

struct Shared {
    handles: RefCell<HandleTable>,
    refs: RefCell<HashMap<u64, RefEntry>>,
    next_ref: Cell<u64>,
    hosts: RefCell<Vec<Rc<dyn CallbackHost>>>,
    thrown: RefCell<HashMap<u64, EngineError>>,
    next_thrown: Cell<u64>,
    active: Cell<Option<NonNull<qjs::JSContext>>>,
    intrinsics: RefCell<Option<Persistent<Object<'static>>>>,
}

/// Engine backed by one QuickJS runtime and context. Not `Send`: it must stay
/// on the thread that created it.
pub struct QuickJsEngine {
    shared: Rc<Shared>,
    context: Context,
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new() -> EngineResult<Self> {
        let runtime = Runtime::new().map_err(startup_error)?;
        let context = Context::full(&runtime).map_err(startup_error)?;
        let shared = Rc::new(Shared {
            handles: RefCell::new(HandleTable::new()),
            refs: RefCell::new(HashMap::new()),
            next_ref: Cell::new(1),
            hosts: RefCell::new(Vec::new()),
            thrown: RefCell::new(HashMap::new()),
            next_thrown: Cell::new(1),
            active: Cell::new(None),
            intrinsics: RefCell::new(None),
        });
        context
            .with(|ctx| -> rquickjs::Result<()> {
                let intrinsics: Object = ctx.eval(INTRINSICS)?;
                *shared.intrinsics.borrow_mut() = Some(Persistent::save(&ctx, intrinsics));
                Ok(())
            })
            .map_err(startup_error)?;
        tracing::debug!("quickjs engine ready");
        Ok(Self {
            shared,
            context,
            runtime,
        })
    }

    /// Handles currently alive across all open regions.
    pub fn live_handles(&self) -> usize {
        self.shared.handles.borrow().live()
    }

    pub fn open_handle_scopes(&self) -> usize {
        self.shared.handles.borrow().open_regions()
    }

    pub fn live_references(&self) -> usize {
        self.shared.refs.borrow().len()
    }

    /// Run `f` with a context, opening one only if none is active.
    fn enter<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>) -> EngineResult<R>) -> EngineResult<R> {
        if let Some(raw) = self.shared.active.get() {
            // SAFETY: `active` is only set while the `Context::with` below is
            // on this thread's stack, so the context is alive and locked.
            let ctx = unsafe { Ctx::from_raw(raw) };
            return f(&ctx);
        }
        self.context.with(|ctx| {
            let _active = ActiveContext::set(&self.shared.active, ctx.as_raw());
            f(&ctx)
        })
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        // Persistent values must be released before the runtime is freed
        let handles = self.shared.handles.borrow_mut().clear();
        let refs: Vec<RefEntry> = self.shared.refs.borrow_mut().drain().map(|(_, e)| e).collect();
        let intrinsics = self.shared.intrinsics.borrow_mut().take();
        drop((handles, refs, intrinsics));
        self.shared.hosts.borrow_mut().clear();
        self.shared.thrown.borrow_mut().clear();
    }
}

impl fmt::Debug for QuickJsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuickJsEngine")
            .field("live_handles", &self.live_handles())
            .field("open_handle_scopes", &self.open_handle_scopes())
            .field("references", &self.live_references())
            .finish()
    }
}

struct ActiveContext<'a>(&'a Cell<Option<NonNull<qjs::JSContext>>>);

impl<'a> ActiveContext<'a> {
    fn set(slot: &'a Cell<Option<NonNull<qjs::JSContext>>>, raw: NonNull<qjs::JSContext>) -> Self {
        slot.set(Some(raw));
        Self(slot)
    }
}

impl Drop for ActiveContext<'_> {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

impl Shared {
    fn store<'js>(&self, ctx: &Ctx<'js>, value: JsValue<'js>) -> RawValue {
        if value.is_undefined() {
            return RawValue::UNDEFINED;
        }
        self.handles.borrow_mut().insert(Persistent::save(ctx, value))
    }

    fn load<'js>(&self, ctx: &Ctx<'js>, raw: RawValue) -> EngineResult<JsValue<'js>> {
        if raw.is_undefined_sentinel() {
            return Ok(JsValue::new_undefined(ctx.clone()));
        }
        let slot = self.handles.borrow().get(raw)?;
        slot.restore(ctx).map_err(|err| self.convert(ctx, err))
    }

    fn intrinsic<'js>(&self, ctx: &Ctx<'js>, name: &str) -> EngineResult<Function<'js>> {
        let table = self.intrinsics.borrow().clone().ok_or_else(|| {
            EngineError::new(EngineStatus::GenericFailure, "engine is shutting down")
        })?;
        let table = table.restore(ctx).map_err(|err| self.convert(ctx, err))?;
        table.get(name).map_err(|err| self.convert(ctx, err))
    }

    fn call_intrinsic<'js, A, R>(&self, ctx: &Ctx<'js>, name: &str, args: A) -> EngineResult<R>
    where
        A: IntoArgs<'js>,
        R: FromJs<'js>,
    {
        let function = self.intrinsic(ctx, name)?;
        function.call(args).map_err(|err| self.convert(ctx, err))
    }

    /// Turn an rquickjs failure into an engine error, taking the pending
    /// exception if there is one.
    fn convert<'js>(&self, ctx: &Ctx<'js>, err: rquickjs::Error) -> EngineError {
        if !matches!(err, rquickjs::Error::Exception) {
            return EngineError::new(EngineStatus::GenericFailure, err.to_string());
        }
        let exception = ctx.catch();
        let object = exception.as_object();
        let stack = object
            .and_then(|o| o.get::<_, Option<String>>("stack").ok().flatten())
            .map(|stack| parse_stack(&stack))
            .unwrap_or_default();

        // A host error that crossed the engine comes back out as itself
        let token = object.and_then(|o| o.get::<_, Option<f64>>(THROWN_KEY).ok().flatten());
        let host = token.and_then(|token| self.thrown.borrow_mut().remove(&(token as u64)));
        if let Some(err) = host {
            return if err.stack.is_empty() {
                err.with_stack(stack)
            } else {
                err
            };
        }

        let message = self
            .call_intrinsic::<_, String>(ctx, "string", (exception,))
            .unwrap_or_else(|_| "uncaught exception".to_string());
        EngineError::new(EngineStatus::PendingException, message).with_stack(stack)
    }

    /// Park `err` and throw a script error that refers to it.
    fn throw_host<'js>(&self, ctx: &Ctx<'js>, err: EngineError) -> rquickjs::Error {
        let token = self.next_thrown.get();
        self.next_thrown.set(token + 1);
        let message = err.message.clone();
        self.thrown.borrow_mut().insert(token, err);
        let error = new_error(ctx, &message).and_then(|error| {
            error.set(THROWN_KEY, token as f64)?;
            Ok(error)
        });
        match error {
            Ok(error) => ctx.throw(error.into_value()),
            Err(other) => other,
        }
    }

    fn invoke_host<'js>(
        &self,
        ctx: &Ctx<'js>,
        token: CallbackToken,
        this: JsValue<'js>,
        args: Vec<JsValue<'js>>,
    ) -> rquickjs::Result<JsValue<'js>> {
        let host = self.hosts.borrow().last().cloned();
        let Some(host) = host else {
            return Err(throw_message(ctx, "host function called outside a host call"));
        };
        let frame = self.handles.borrow_mut().open(true);
        let this = self.store(ctx, this);
        let args: Vec<RawValue> = args.into_iter().map(|arg| self.store(ctx, arg)).collect();

        // No borrow is held here: the host may re-enter the engine.
        let outcome = host
            .invoke(token, this, &args)
            .and_then(|raw| self.load(ctx, raw));

        let (leaked, released) = self.handles.borrow_mut().unwind_to(frame);
        drop(released);
        if leaked > 0 {
            tracing::warn!(leaked, "host callback returned with handle scopes still open");
        }
        outcome.map_err(|err| self.throw_host(ctx, err))
    }

    fn weaken<'js>(&self, ctx: &Ctx<'js>, target: JsValue<'js>) -> EngineResult<Held> {
        if !target.is_object() {
            // Primitives are never collected
            return Ok(Held::Strong(Persistent::save(ctx, target)));
        }
        let weak: JsValue = self.call_intrinsic(ctx, "weak", (target,))?;
        Ok(Held::Weak(Persistent::save(ctx, weak)))
    }

    fn target<'js>(&self, ctx: &Ctx<'js>, held: &Held) -> EngineResult<Option<JsValue<'js>>> {
        match held {
            Held::Strong(slot) => {
                let value = slot.clone().restore(ctx).map_err(|err| self.convert(ctx, err))?;
                Ok(Some(value))
            }
            Held::Weak(slot) => {
                let weak = slot.clone().restore(ctx).map_err(|err| self.convert(ctx, err))?;
                let target: JsValue = self.call_intrinsic(ctx, "deref", (weak,))?;
                Ok((!target.is_undefined()).then_some(target))
            }
        }
    }

    fn held(&self, reference: RawRef) -> EngineResult<(Held, u32)> {
        let refs = self.refs.borrow();
        let entry = refs.get(&reference.0).ok_or_else(|| missing_reference(reference))?;
        let held = match &entry.held {
            Held::Strong(slot) => Held::Strong(slot.clone()),
            Held::Weak(slot) => Held::Weak(slot.clone()),
        };
        Ok((held, entry.count))
    }

    /// Swap in a new count and holding, dropping the old one outside the
    /// borrow.
    fn update(&self, reference: RawRef, count: u32, held: Held) -> EngineResult<u32> {
        let previous = {
            let mut refs = self.refs.borrow_mut();
            let entry = refs
                .get_mut(&reference.0)
                .ok_or_else(|| missing_reference(reference))?;
            entry.count = count;
            std::mem::replace(&mut entry.held, held)
        };
        drop(previous);
        Ok(count)
    }
}

fn make_function<'js>(
    shared: &Rc<Shared>,
    ctx: &Ctx<'js>,
    name: &str,
    token: CallbackToken,
) -> EngineResult<RawValue> {
    let weak: Weak<Shared> = Rc::downgrade(shared);
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, this: This<JsValue<'js>>, args: Rest<JsValue<'js>>| {
            match weak.upgrade() {
                Some(shared) => shared.invoke_host(&ctx, token, this.0, args.0),
                None => Err(throw_message(&ctx, "engine was dropped")),
            }
        },
    )
    .and_then(|function| function.with_name(name))
    .map_err(|err| shared.convert(ctx, err))?;
    Ok(shared.store(ctx, function.into_value()))
}

fn new_error<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Object<'js>> {
    let constructor: Function = ctx.globals().get("Error")?;
    constructor.call((message,))
}

fn throw_message(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    match new_error(ctx, message) {
        Ok(error) => ctx.throw(error.into_value()),
        Err(err) => err,
    }
}

fn kind_of(value: &JsValue<'_>) -> ValueKind {
    match value.type_of() {
        Type::Undefined => ValueKind::Undefined,
        Type::Null => ValueKind::Null,
        Type::Bool => ValueKind::Boolean,
        Type::Int | Type::Float => ValueKind::Number,
        Type::String => ValueKind::String,
        Type::Function | Type::Constructor => ValueKind::Function,
        _ => ValueKind::Object,
    }
}

fn nullish_access(target: &JsValue<'_>, write: bool, key: &str) -> Option<EngineError> {
    let kind = kind_of(target);
    let (verb, action) = if write { ("set", "setting") } else { ("read", "reading") };
    matches!(kind, ValueKind::Undefined | ValueKind::Null).then(|| {
        EngineError::new(
            EngineStatus::ObjectExpected,
            format!("TypeError: Cannot {verb} properties of {kind} ({action} '{key}')"),
        )
    })
}

fn require_object<'js>(value: JsValue<'js>, key: &str) -> EngineResult<Object<'js>> {
    let kind = kind_of(&value);
    value.into_object().ok_or_else(|| {
        EngineError::new(
            EngineStatus::ObjectExpected,
            format!("TypeError: cannot use {kind} as an object ({key})"),
        )
    })
}

fn mismatch(status: EngineStatus, expected: &str, value: &JsValue<'_>) -> EngineError {
    EngineError::new(status, format!("expected {expected}, got {}", kind_of(value)))
}

fn missing_reference(reference: RawRef) -> EngineError {
    EngineError::new(
        EngineStatus::InvalidArg,
        format!("reference {} does not exist", reference.0),
    )
}

fn startup_error(err: rquickjs::Error) -> EngineError {
    EngineError::new(EngineStatus::GenericFailure, format!("quickjs startup failed: {err}"))
}

/// Parse a QuickJS `stack` string (`    at name (file:line:column)` lines).
pub fn parse_stack(stack: &str) -> Vec<EngineFrame> {
    stack
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("at ")?;
            let (function, location) = match rest.rfind(" (") {
                Some(open) if rest.ends_with(')') => {
                    (&rest[..open], parse_location(&rest[open + 2..rest.len() - 1]))
                }
                _ => (rest, None),
            };
            Some(EngineFrame {
                function: function.to_string(),
                location,
            })
        })
        .collect()
}

fn parse_location(text: &str) -> Option<SourceLocation> {
    let mut parts = text.rsplitn(3, ':');
    let last = parts.next()?;
    let middle = parts.next()?;
    match parts.next() {
        Some(file) => Some(SourceLocation {
            file: file.to_string(),
            line: middle.parse().ok()?,
            column: last.parse().ok()?,
        }),
        None => Some(SourceLocation {
            file: middle.to_string(),
            line: last.parse().ok()?,
            column: 0,
        }),
    }
}

impl Engine for QuickJsEngine {
    fn open_handle_scope(&self, escapable: bool) -> EngineResult<RawScope> {
        Ok(self.shared.handles.borrow_mut().open(escapable))
    }

    fn close_handle_scope(&self, scope: RawScope) -> EngineResult<()> {
        let released = self.shared.handles.borrow_mut().close(scope)?;
        drop(released);
        Ok(())
    }

    fn escape_handle(&self, scope: RawScope, value: RawValue) -> EngineResult<RawValue> {
        self.shared.handles.borrow_mut().escape(scope, value)
    }

    fn null(&self) -> EngineResult<RawValue> {
        self.enter(|ctx| Ok(self.shared.store(ctx, JsValue::new_null(ctx.clone()))))
    }

    fn boolean(&self, value: bool) -> EngineResult<RawValue> {
        self.enter(|ctx| Ok(self.shared.store(ctx, JsValue::new_bool(ctx.clone(), value))))
    }

    fn number(&self, value: f64) -> EngineResult<RawValue> {
        self.enter(|ctx| Ok(self.shared.store(ctx, JsValue::new_float(ctx.clone(), value))))
    }

    fn string(&self, value: &str) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let string = rquickjs::String::from_str(ctx.clone(), value)
                .map_err(|err| self.shared.convert(ctx, err))?;
            Ok(self.shared.store(ctx, string.into_value()))
        })
    }

    fn object(&self) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let object = Object::new(ctx.clone()).map_err(|err| self.shared.convert(ctx, err))?;
            Ok(self.shared.store(ctx, object.into_value()))
        })
    }

    fn array(&self) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let array = Array::new(ctx.clone()).map_err(|err| self.shared.convert(ctx, err))?;
            Ok(self.shared.store(ctx, array.into_value()))
        })
    }

    fn function(&self, name: &str, token: CallbackToken) -> EngineResult<RawValue> {
        self.enter(|ctx| make_function(&self.shared, ctx, name, token))
    }

    fn error(&self, message: &str) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let error = new_error(ctx, message).map_err(|err| self.shared.convert(ctx, err))?;
            Ok(self.shared.store(ctx, error.into_value()))
        })
    }

    fn global(&self) -> EngineResult<RawValue> {
        self.enter(|ctx| Ok(self.shared.store(ctx, ctx.globals().into_value())))
    }

    fn type_of(&self, value: RawValue) -> EngineResult<ValueKind> {
        self.enter(|ctx| Ok(kind_of(&self.shared.load(ctx, value)?)))
    }

    fn is_array(&self, value: RawValue) -> EngineResult<bool> {
        self.enter(|ctx| Ok(self.shared.load(ctx, value)?.is_array()))
    }

    fn strict_equals(&self, a: RawValue, b: RawValue) -> EngineResult<bool> {
        self.enter(|ctx| {
            let a = self.shared.load(ctx, a)?;
            let b = self.shared.load(ctx, b)?;
            self.shared.call_intrinsic(ctx, "same", (a, b))
        })
    }

    fn get_named_property(&self, object: RawValue, key: &str) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, object)?;
            if let Some(err) = nullish_access(&target, false, key) {
                return Err(err);
            }
            let value: JsValue = self.shared.call_intrinsic(ctx, "get", (target, key))?;
            Ok(self.shared.store(ctx, value))
        })
    }

    fn set_named_property(
        &self,
        object: RawValue,
        key: &str,
        value: RawValue,
    ) -> EngineResult<()> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, object)?;
            if let Some(err) = nullish_access(&target, true, key) {
                return Err(err);
            }
            let value = self.shared.load(ctx, value)?;
            self.shared.call_intrinsic(ctx, "set", (target, key, value))
        })
    }

    fn has_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool> {
        self.enter(|ctx| {
            let target = require_object(self.shared.load(ctx, object)?, key)?;
            target.contains_key(key).map_err(|err| self.shared.convert(ctx, err))
        })
    }

    fn delete_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool> {
        self.enter(|ctx| {
            let target = require_object(self.shared.load(ctx, object)?, key)?;
            let convert = |err| self.shared.convert(ctx, err);
            let had = target.contains_key(key).map_err(convert)?;
            target.remove(key).map_err(convert)?;
            Ok(had && !target.contains_key(key).map_err(convert)?)
        })
    }

    fn get_element(&self, object: RawValue, index: u32) -> EngineResult<RawValue> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, object)?;
            if let Some(err) = nullish_access(&target, false, &index.to_string()) {
                return Err(err);
            }
            let value: JsValue = self.shared.call_intrinsic(ctx, "get", (target, index))?;
            Ok(self.shared.store(ctx, value))
        })
    }

    fn set_element(&self, object: RawValue, index: u32, value: RawValue) -> EngineResult<()> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, object)?;
            if let Some(err) = nullish_access(&target, true, &index.to_string()) {
                return Err(err);
            }
            let value = self.shared.load(ctx, value)?;
            self.shared.call_intrinsic(ctx, "set", (target, index, value))
        })
    }

    fn array_length(&self, object: RawValue) -> EngineResult<u32> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, object)?;
            match target.as_array() {
                Some(array) => Ok(array.len() as u32),
                None => Err(EngineError::new(
                    EngineStatus::InvalidArg,
                    "value is not an array",
                )),
            }
        })
    }

    fn call_function(
        &self,
        host: Rc<dyn CallbackHost>,
        function: RawValue,
        this: RawValue,
        args: &[RawValue],
    ) -> EngineResult<RawValue> {
        self.enter(move |ctx| {
            let shared = &self.shared;
            let target = shared.load(ctx, function)?;
            let Some(callee) = target.as_function().cloned() else {
                return Err(EngineError::new(
                    EngineStatus::FunctionExpected,
                    format!("TypeError: {} is not a function", kind_of(&target)),
                ));
            };
            let this = shared.load(ctx, this)?;
            let args = args
                .iter()
                .map(|raw| shared.load(ctx, *raw))
                .collect::<EngineResult<Vec<_>>>()?;

            shared.hosts.borrow_mut().push(host);
            let outcome = callee.call::<_, JsValue>((This(this), Rest(args)));
            shared.hosts.borrow_mut().pop();

            let result = outcome.map_err(|err| shared.convert(ctx, err))?;
            Ok(shared.store(ctx, result))
        })
    }

    fn coerce_to_string(&self, value: RawValue) -> EngineResult<String> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            self.shared.call_intrinsic(ctx, "string", (value,))
        })
    }

    fn coerce_to_number(&self, value: RawValue) -> EngineResult<f64> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            self.shared.call_intrinsic(ctx, "number", (value,))
        })
    }

    fn coerce_to_bool(&self, value: RawValue) -> EngineResult<bool> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            self.shared.call_intrinsic(ctx, "truthy", (value,))
        })
    }

    fn get_value_string(&self, value: RawValue) -> EngineResult<String> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            match value.as_string() {
                Some(string) => string.to_string().map_err(|err| self.shared.convert(ctx, err)),
                None => Err(mismatch(EngineStatus::StringExpected, "a string", &value)),
            }
        })
    }

    fn get_value_f64(&self, value: RawValue) -> EngineResult<f64> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            value
                .as_number()
                .ok_or_else(|| mismatch(EngineStatus::NumberExpected, "a number", &value))
        })
    }

    fn get_value_bool(&self, value: RawValue) -> EngineResult<bool> {
        self.enter(|ctx| {
            let value = self.shared.load(ctx, value)?;
            value
                .as_bool()
                .ok_or_else(|| mismatch(EngineStatus::BooleanExpected, "a boolean", &value))
        })
    }

    fn create_reference(&self, value: RawValue, initial_count: u32) -> EngineResult<RawRef> {
        self.enter(|ctx| {
            let target = self.shared.load(ctx, value)?;
            let held = if initial_count == 0 {
                self.shared.weaken(ctx, target)?
            } else {
                Held::Strong(Persistent::save(ctx, target))
            };
            let id = self.shared.next_ref.get();
            self.shared.next_ref.set(id + 1);
            self.shared.refs.borrow_mut().insert(
                id,
                RefEntry {
                    held,
                    count: initial_count,
                },
            );
            Ok(RawRef(id))
        })
    }

    fn reference_ref(&self, reference: RawRef) -> EngineResult<u32> {
        self.enter(|ctx| {
            let (held, count) = self.shared.held(reference)?;
            let held = match held {
                Held::Weak(_) if count == 0 => match self.shared.target(ctx, &held)? {
                    Some(target) => Held::Strong(Persistent::save(ctx, target)),
                    // Collected targets stay gone
                    None => held,
                },
                other => other,
            };
            self.shared.update(reference, count + 1, held)
        })
    }

    fn reference_unref(&self, reference: RawRef) -> EngineResult<u32> {
        self.enter(|ctx| {
            let (held, count) = self.shared.held(reference)?;
            if count == 0 {
                return Err(EngineError::new(
                    EngineStatus::GenericFailure,
                    format!("reference {} is already weak", reference.0),
                ));
            }
            let held = match held {
                Held::Strong(slot) if count == 1 => {
                    let target = slot.restore(ctx).map_err(|err| self.shared.convert(ctx, err))?;
                    self.shared.weaken(ctx, target)?
                }
                other => other,
            };
            self.shared.update(reference, count - 1, held)
        })
    }

    fn reference_value(&self, reference: RawRef) -> EngineResult<Option<RawValue>> {
        self.enter(|ctx| {
            let (held, _) = self.shared.held(reference)?;
            let target = self.shared.target(ctx, &held)?;
            Ok(target.map(|value| self.shared.store(ctx, value)))
        })
    }

    fn delete_reference(&self, reference: RawRef) -> EngineResult<()> {
        let removed = self.shared.refs.borrow_mut().remove(&reference.0);
        match removed {
            Some(entry) => {
                drop(entry);
                Ok(())
            }
            None => Err(missing_reference(reference)),
        }
    }

    fn capture_stack(&self) -> Vec<EngineFrame> {
        self.enter(|ctx| {
            let error = new_error(ctx, "").map_err(|err| self.shared.convert(ctx, err))?;
            let stack: Option<String> = error.get("stack").map_err(|err| self.shared.convert(ctx, err))?;
            Ok(stack.map(|stack| parse_stack(&stack)).unwrap_or_default())
        })
        .unwrap_or_default()
    }

    fn collect_garbage(&self) {
        match self.shared.active.get() {
            // SAFETY: an active context belongs to this engine's runtime and
            // is alive for as long as it is marked active.
            Some(raw) => unsafe { qjs::JS_RunGC(qjs::JS_GetRuntime(raw.as_ptr())) },
            None => self.runtime.run_gc(),
        }
        tracing::debug!(live_handles = self.live_handles(), "quickjs engine collected garbage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles its first argument by calling back into the engine.
    struct Doubler {
        engine: Rc<QuickJsEngine>,
    }

    impl CallbackHost for Doubler {
        fn invoke(
            &self,
            token: CallbackToken,
            _this: RawValue,
            args: &[RawValue],
        ) -> EngineResult<RawValue> {
            match token.0 {
                1 => {
                    let arg = args.first().copied().unwrap_or(RawValue::UNDEFINED);
                    let n = self.engine.get_value_f64(arg)?;
                    self.engine.number(n * 2.0)
                }
                _ => Err(EngineError::new(EngineStatus::PendingException, "boom")),
            }
        }
    }

    #[test]
    fn test_properties_round_trip_through_handles() {
        let engine = QuickJsEngine::new().unwrap();
        let obj = engine.object().unwrap();
        let value = engine.number(7.0).unwrap();
        engine.set_named_property(obj, "x", value).unwrap();

        let read = engine.get_named_property(obj, "x").unwrap();
        assert_eq!(engine.get_value_f64(read).unwrap(), 7.0);
        assert!(engine.has_named_property(obj, "x").unwrap());
        assert!(engine.delete_named_property(obj, "x").unwrap());
        let missing = engine.get_named_property(obj, "x").unwrap();
        assert_eq!(engine.type_of(missing).unwrap(), ValueKind::Undefined);
    }

    #[test]
    fn test_reading_from_undefined_is_a_type_error() {
        let engine = QuickJsEngine::new().unwrap();
        let err = engine
            .get_named_property(RawValue::UNDEFINED, "name")
            .unwrap_err();
        assert_eq!(err.status, EngineStatus::ObjectExpected);
        assert!(err.message.contains("reading 'name'"));
    }

    #[test]
    fn test_host_can_reenter_during_a_call() {
        let engine = Rc::new(QuickJsEngine::new().unwrap());
        let host = Rc::new(Doubler {
            engine: engine.clone(),
        });
        let double = engine.function("double", CallbackToken(1)).unwrap();
        let arg = engine.number(21.0).unwrap();
        let out = engine
            .call_function(host, double, RawValue::UNDEFINED, &[arg])
            .unwrap();
        assert_eq!(engine.get_value_f64(out).unwrap(), 42.0);
        assert_eq!(engine.open_handle_scopes(), 0);
    }

    #[test]
    fn test_host_error_comes_back_with_script_stack() {
        let engine = Rc::new(QuickJsEngine::new().unwrap());
        let host = Rc::new(Doubler {
            engine: engine.clone(),
        });
        let fail = engine.function("fail", CallbackToken(2)).unwrap();
        let err = engine
            .call_function(host, fail, RawValue::UNDEFINED, &[])
            .unwrap_err();
        assert_eq!(err.status, EngineStatus::PendingException);
        assert_eq!(err.message, "boom");
        assert!(err.stack.iter().any(|frame| frame.function == "fail"));
    }

    #[test]
    fn test_calling_a_non_function_is_rejected() {
        let engine = Rc::new(QuickJsEngine::new().unwrap());
        let host = Rc::new(Doubler {
            engine: engine.clone(),
        });
        let obj = engine.object().unwrap();
        let err = engine
            .call_function(host, obj, RawValue::UNDEFINED, &[])
            .unwrap_err();
        assert_eq!(err.status, EngineStatus::FunctionExpected);
    }

    #[test]
    fn test_closing_a_region_releases_its_handles() {
        let engine = QuickJsEngine::new().unwrap();
        let outer = engine.open_handle_scope(true).unwrap();
        let kept = engine.string("kept").unwrap();
        let inner = engine.open_handle_scope(true).unwrap();
        let value = engine.number(3.0).unwrap();
        let escaped = engine.escape_handle(inner, value).unwrap();
        assert_eq!(
            engine.escape_handle(inner, value).unwrap_err().status,
            EngineStatus::EscapeCalledTwice
        );
        assert_eq!(
            engine.close_handle_scope(outer).unwrap_err().status,
            EngineStatus::HandleScopeMismatch
        );
        engine.close_handle_scope(inner).unwrap();

        assert!(engine.get_value_f64(value).is_err());
        assert_eq!(engine.get_value_f64(escaped).unwrap(), 3.0);
        assert_eq!(engine.get_value_string(kept).unwrap(), "kept");
        engine.close_handle_scope(outer).unwrap();
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn test_weak_reference_cleared_by_collection() {
        let engine = QuickJsEngine::new().unwrap();
        let scope = engine.open_handle_scope(false).unwrap();
        let obj = engine.object().unwrap();
        let weak = engine.create_reference(obj, 0).unwrap();
        let strong = engine.create_reference(obj, 1).unwrap();
        engine.close_handle_scope(scope).unwrap();

        engine.reference_unref(strong).unwrap();
        engine.collect_garbage();
        assert!(engine.reference_value(weak).unwrap().is_none());
        assert!(engine.reference_value(strong).unwrap().is_none());
        engine.delete_reference(weak).unwrap();
        engine.delete_reference(strong).unwrap();
        assert_eq!(engine.live_references(), 0);
    }

    #[test]
    fn test_strong_reference_keeps_target() {
        let engine = QuickJsEngine::new().unwrap();
        let scope = engine.open_handle_scope(false).unwrap();
        let obj = engine.object().unwrap();
        let tag = engine.string("kept").unwrap();
        engine.set_named_property(obj, "tag", tag).unwrap();
        let strong = engine.create_reference(obj, 1).unwrap();
        engine.close_handle_scope(scope).unwrap();

        engine.collect_garbage();
        let reading = engine.open_handle_scope(false).unwrap();
        let target = engine.reference_value(strong).unwrap().expect("strong target");
        let tag = engine.get_named_property(target, "tag").unwrap();
        assert_eq!(engine.get_value_string(tag).unwrap(), "kept");
        engine.close_handle_scope(reading).unwrap();
    }

    #[test]
    fn test_coercions_follow_engine_rules() {
        let engine = QuickJsEngine::new().unwrap();
        let arr = engine.array().unwrap();
        let one = engine.number(1.0).unwrap();
        let two = engine.string("two").unwrap();
        engine.set_element(arr, 0, one).unwrap();
        engine.set_element(arr, 2, two).unwrap();

        assert_eq!(engine.array_length(arr).unwrap(), 3);
        assert_eq!(engine.coerce_to_string(arr).unwrap(), "1,,two");
        assert!(engine.coerce_to_number(arr).unwrap().is_nan());
        assert!(engine.coerce_to_bool(arr).unwrap());
        assert!(!engine.coerce_to_bool(RawValue::UNDEFINED).unwrap());
        assert!(engine.strict_equals(arr, arr).unwrap());
        let other = engine.number(1.0).unwrap();
        assert!(engine.strict_equals(one, other).unwrap());
    }

    #[test]
    fn test_far_element_write_stays_sparse() {
        let engine = QuickJsEngine::new().unwrap();
        let arr = engine.array().unwrap();
        let one = engine.number(1.0).unwrap();
        engine.set_element(arr, u32::MAX - 1, one).unwrap();
        assert_eq!(engine.array_length(arr).unwrap(), u32::MAX);
        let read = engine.get_element(arr, u32::MAX - 1).unwrap();
        assert_eq!(engine.get_value_f64(read).unwrap(), 1.0);
    }

    #[test]
    fn test_parse_stack_lines() {
        let frames = parse_stack("Error: boom\n    at load (app.js:3:7)\n    at fail (native)\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function, "load");
        assert_eq!(
            frames[0].location,
            Some(SourceLocation {
                file: "app.js".to_string(),
                line: 3,
                column: 7,
            })
        );
        assert_eq!(frames[1], EngineFrame::native("fail"));
    }
}
