//! In-process reference engine
//!
//! `HeapEngine` is a small single-threaded object engine with the same
//! lifetime rules as an embeddable script VM: handles live in nested regions,
//! persistent references count like N-API references (zero = weak), and
//! unreachable objects are reclaimed by an explicit mark-sweep pass.

mod handles;
mod object;

use crate::engine::{
    CallbackHost, CallbackToken, Engine, EngineError, EngineFrame, EngineResult, EngineStatus,
    RawRef, RawScope, RawValue, ValueKind,
};
use handles::HandleStack;
use object::{number_to_string, string_to_number, HeapObject, ObjKind, ObjRef, Val};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Furthest an element write may extend a dense array past its end.
const MAX_DENSE_GAP: usize = 1 << 16;

struct ObjSlot {
    generation: u32,
    obj: Option<HeapObject>,
}

struct RefSlot {
    target: Val,
    count: u32,
}

struct Heap {
    objects: Vec<ObjSlot>,
    free: Vec<u32>,
    handles: HandleStack,
    refs: HashMap<u64, RefSlot>,
    next_ref: u64,
    global: ObjRef,
    call_stack: Vec<EngineFrame>,
}

/// Single-threaded reference engine. Not `Send`: it must stay on the thread
/// that created it.
pub struct HeapEngine {
    heap: RefCell<Heap>,
}

impl HeapEngine {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: Vec::new(),
            free: Vec::new(),
            handles: HandleStack::new(),
            refs: HashMap::new(),
            next_ref: 1,
            global: ObjRef {
                index: 0,
                generation: 0,
            },
            call_stack: Vec::new(),
        };
        heap.global = heap.alloc_obj(HeapObject::new(ObjKind::Plain));
        Self {
            heap: RefCell::new(heap),
        }
    }

    /// Handles currently alive across all open regions.
    pub fn live_handles(&self) -> usize {
        self.heap.borrow().handles.live()
    }

    pub fn open_handle_scopes(&self) -> usize {
        self.heap.borrow().handles.open_regions()
    }

    /// Objects not yet reclaimed, the global object included.
    pub fn live_objects(&self) -> usize {
        self.heap
            .borrow()
            .objects
            .iter()
            .filter(|s| s.obj.is_some())
            .count()
    }

    pub fn live_references(&self) -> usize {
        self.heap.borrow().refs.len()
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> EngineResult<R>) -> EngineResult<R> {
        let mut heap = self.heap.borrow_mut();
        f(&mut heap).map_err(|err| heap.annotate(err))
    }
}

impl Default for HeapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap.borrow();
        f.debug_struct("HeapEngine")
            .field("live_handles", &heap.handles.live())
            .field("open_handle_scopes", &heap.handles.open_regions())
            .field("references", &heap.refs.len())
            .finish()
    }
}

impl Heap {
    fn alloc_obj(&mut self, obj: HeapObject) -> ObjRef {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.objects[index as usize];
            slot.obj = Some(obj);
            ObjRef {
                index,
                generation: slot.generation,
            }
        } else {
            self.objects.push(ObjSlot {
                generation: 1,
                obj: Some(obj),
            });
            ObjRef {
                index: (self.objects.len() - 1) as u32,
                generation: 1,
            }
        }
    }

    fn alive(&self, o: ObjRef) -> bool {
        self.objects
            .get(o.index as usize)
            .map_or(false, |s| s.generation == o.generation && s.obj.is_some())
    }

    fn obj(&self, o: ObjRef) -> EngineResult<&HeapObject> {
        self.objects
            .get(o.index as usize)
            .filter(|s| s.generation == o.generation)
            .and_then(|s| s.obj.as_ref())
            .ok_or_else(|| EngineError::new(EngineStatus::InvalidArg, "object was collected"))
    }

    fn obj_mut(&mut self, o: ObjRef) -> EngineResult<&mut HeapObject> {
        self.objects
            .get_mut(o.index as usize)
            .filter(|s| s.generation == o.generation)
            .and_then(|s| s.obj.as_mut())
            .ok_or_else(|| EngineError::new(EngineStatus::InvalidArg, "object was collected"))
    }

    fn snapshot(&self) -> Vec<EngineFrame> {
        self.call_stack.iter().rev().cloned().collect()
    }

    fn annotate(&self, err: EngineError) -> EngineError {
        if err.stack.is_empty() {
            let stack = self.snapshot();
            err.with_stack(stack)
        } else {
            err
        }
    }

    fn alloc_object_handle(&mut self, obj: HeapObject) -> RawValue {
        let o = self.alloc_obj(obj);
        self.handles.alloc(Val::Object(o))
    }

    fn kind_of(&self, val: &Val) -> EngineResult<ValueKind> {
        match (val.kind(), val) {
            (Some(kind), _) => Ok(kind),
            (None, Val::Object(o)) => Ok(self.obj(*o)?.kind()),
            (None, _) => Ok(ValueKind::Undefined),
        }
    }

    fn object_of(&self, raw: RawValue, reading: &str) -> EngineResult<ObjRef> {
        match self.handles.get(raw)? {
            Val::Object(o) => Ok(o),
            other => Err(EngineError::new(
                EngineStatus::ObjectExpected,
                format!(
                    "TypeError: cannot use {} as an object ({})",
                    other.describe(),
                    reading
                ),
            )),
        }
    }

    fn read_named(&self, target: &Val, key: &str) -> EngineResult<Val> {
        match target {
            Val::Object(o) => {
                let obj = self.obj(*o)?;
                if key == "length" {
                    if let ObjKind::Array(items) = &obj.kind {
                        return Ok(Val::Number(items.len() as f64));
                    }
                }
                Ok(obj.get(key).cloned().unwrap_or(Val::Undefined))
            }
            Val::Undefined | Val::Null => Err(EngineError::new(
                EngineStatus::ObjectExpected,
                format!(
                    "TypeError: Cannot read properties of {} (reading '{}')",
                    target.describe(),
                    key
                ),
            )),
            Val::Str(s) if key == "length" => Ok(Val::Number(s.chars().count() as f64)),
            _ => Ok(Val::Undefined),
        }
    }

    fn write_named(&mut self, target: &Val, key: &str, val: Val) -> EngineResult<()> {
        match target {
            Val::Object(o) => {
                self.obj_mut(*o)?.set(key, val);
                Ok(())
            }
            Val::Undefined | Val::Null => Err(EngineError::new(
                EngineStatus::ObjectExpected,
                format!(
                    "TypeError: Cannot set properties of {} (setting '{}')",
                    target.describe(),
                    key
                ),
            )),
            // Writes to primitives are silently dropped
            _ => Ok(()),
        }
    }

    fn to_display_string(&self, val: &Val, joining: &mut Vec<ObjRef>) -> EngineResult<String> {
        Ok(match val {
            Val::Undefined => "undefined".to_string(),
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Number(n) => number_to_string(*n),
            Val::Str(s) => s.to_string(),
            Val::Object(o) => {
                let obj = self.obj(*o)?;
                match &obj.kind {
                    ObjKind::Plain => "[object Object]".to_string(),
                    ObjKind::Function { name, .. } => {
                        format!("function {name}() {{ [native code] }}")
                    }
                    ObjKind::Error => {
                        let name = obj.get("name").cloned().unwrap_or(Val::Undefined);
                        let message = obj.get("message").cloned().unwrap_or(Val::Undefined);
                        format!(
                            "{}: {}",
                            self.to_display_string(&name, joining)?,
                            self.to_display_string(&message, joining)?
                        )
                    }
                    ObjKind::Array(items) => {
                        // An array already being joined renders empty
                        if joining.contains(o) {
                            return Ok(String::new());
                        }
                        joining.push(*o);
                        let mut parts = Vec::with_capacity(items.len());
                        for item in items {
                            parts.push(match item {
                                Val::Undefined | Val::Null => String::new(),
                                other => self.to_display_string(other, joining)?,
                            });
                        }
                        joining.pop();
                        parts.join(",")
                    }
                }
            }
        })
    }

    fn to_number(&self, val: &Val) -> EngineResult<f64> {
        Ok(match val {
            Val::Undefined => f64::NAN,
            Val::Null => 0.0,
            Val::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Val::Number(n) => *n,
            Val::Str(s) => string_to_number(s),
            Val::Object(_) => string_to_number(&self.to_display_string(val, &mut Vec::new())?),
        })
    }

    fn collect(&mut self) -> usize {
        let mut marked = vec![false; self.objects.len()];
        let mut work: Vec<ObjRef> = vec![self.global];
        let object_of = |v: &Val| match v {
            Val::Object(o) => Some(*o),
            _ => None,
        };
        work.extend(self.handles.values().filter_map(object_of));
        work.extend(
            self.refs
                .values()
                .filter(|r| r.count > 0)
                .filter_map(|r| object_of(&r.target)),
        );

        while let Some(o) = work.pop() {
            let index = o.index as usize;
            if marked[index] || !self.alive(o) {
                continue;
            }
            marked[index] = true;
            if let Some(obj) = self.objects[index].obj.as_ref() {
                work.extend(obj.children());
            }
        }

        let mut freed = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            if slot.obj.is_some() && !marked[index] {
                slot.obj = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }
}

impl Engine for HeapEngine {
    fn open_handle_scope(&self, escapable: bool) -> EngineResult<RawScope> {
        Ok(self.heap.borrow_mut().handles.open(escapable))
    }

    fn close_handle_scope(&self, scope: RawScope) -> EngineResult<()> {
        self.with_heap(|heap| heap.handles.close(scope))
    }

    fn escape_handle(&self, scope: RawScope, value: RawValue) -> EngineResult<RawValue> {
        self.with_heap(|heap| heap.handles.escape(scope, value))
    }

    fn null(&self) -> EngineResult<RawValue> {
        Ok(self.heap.borrow_mut().handles.alloc(Val::Null))
    }

    fn boolean(&self, value: bool) -> EngineResult<RawValue> {
        Ok(self.heap.borrow_mut().handles.alloc(Val::Bool(value)))
    }

    fn number(&self, value: f64) -> EngineResult<RawValue> {
        Ok(self.heap.borrow_mut().handles.alloc(Val::Number(value)))
    }

    fn string(&self, value: &str) -> EngineResult<RawValue> {
        Ok(self.heap.borrow_mut().handles.alloc(Val::Str(value.into())))
    }

    fn object(&self) -> EngineResult<RawValue> {
        Ok(self
            .heap
            .borrow_mut()
            .alloc_object_handle(HeapObject::new(ObjKind::Plain)))
    }

    fn array(&self) -> EngineResult<RawValue> {
        Ok(self
            .heap
            .borrow_mut()
            .alloc_object_handle(HeapObject::new(ObjKind::Array(Vec::new()))))
    }

    fn function(&self, name: &str, token: CallbackToken) -> EngineResult<RawValue> {
        let mut obj = HeapObject::new(ObjKind::Function {
            name: name.to_string(),
            token,
        });
        obj.set("name", Val::Str(name.into()));
        Ok(self.heap.borrow_mut().alloc_object_handle(obj))
    }

    fn error(&self, message: &str) -> EngineResult<RawValue> {
        let mut heap = self.heap.borrow_mut();
        let mut stack = format!("Error: {message}");
        for frame in heap.snapshot() {
            stack.push_str(&format!("\n    at {} (native)", frame.function));
        }
        let mut obj = HeapObject::new(ObjKind::Error);
        obj.set("name", Val::Str("Error".into()));
        obj.set("message", Val::Str(message.into()));
        obj.set("stack", Val::Str(stack.into()));
        Ok(heap.alloc_object_handle(obj))
    }

    fn global(&self) -> EngineResult<RawValue> {
        let mut heap = self.heap.borrow_mut();
        let global = heap.global;
        Ok(heap.handles.alloc(Val::Object(global)))
    }

    fn type_of(&self, value: RawValue) -> EngineResult<ValueKind> {
        self.with_heap(|heap| {
            let val = heap.handles.get(value)?;
            heap.kind_of(&val)
        })
    }

    fn is_array(&self, value: RawValue) -> EngineResult<bool> {
        self.with_heap(|heap| match heap.handles.get(value)? {
            Val::Object(o) => Ok(matches!(heap.obj(o)?.kind, ObjKind::Array(_))),
            _ => Ok(false),
        })
    }

    fn strict_equals(&self, a: RawValue, b: RawValue) -> EngineResult<bool> {
        self.with_heap(|heap| Ok(heap.handles.get(a)?.strict_equals(&heap.handles.get(b)?)))
    }

    fn get_named_property(&self, object: RawValue, key: &str) -> EngineResult<RawValue> {
        self.with_heap(|heap| {
            let target = heap.handles.get(object)?;
            let val = heap.read_named(&target, key)?;
            Ok(heap.handles.alloc(val))
        })
    }

    fn set_named_property(
        &self,
        object: RawValue,
        key: &str,
        value: RawValue,
    ) -> EngineResult<()> {
        self.with_heap(|heap| {
            let target = heap.handles.get(object)?;
            let val = heap.handles.get(value)?;
            heap.write_named(&target, key, val)
        })
    }

    fn has_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool> {
        self.with_heap(|heap| {
            let o = heap.object_of(object, key)?;
            let obj = heap.obj(o)?;
            let is_length = key == "length" && matches!(obj.kind, ObjKind::Array(_));
            Ok(is_length || obj.get(key).is_some())
        })
    }

    fn delete_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool> {
        self.with_heap(|heap| {
            let o = heap.object_of(object, key)?;
            Ok(heap.obj_mut(o)?.remove(key))
        })
    }

    fn get_element(&self, object: RawValue, index: u32) -> EngineResult<RawValue> {
        self.with_heap(|heap| {
            let target = heap.handles.get(object)?;
            let val = match &target {
                Val::Object(o) => match &heap.obj(*o)?.kind {
                    ObjKind::Array(items) => {
                        items.get(index as usize).cloned().unwrap_or(Val::Undefined)
                    }
                    _ => heap.read_named(&target, &index.to_string())?,
                },
                _ => heap.read_named(&target, &index.to_string())?,
            };
            Ok(heap.handles.alloc(val))
        })
    }

    fn set_element(&self, object: RawValue, index: u32, value: RawValue) -> EngineResult<()> {
        self.with_heap(|heap| {
            let target = heap.handles.get(object)?;
            let val = heap.handles.get(value)?;
            if let Val::Object(o) = &target {
                if let ObjKind::Array(items) = &mut heap.obj_mut(*o)?.kind {
                    let index = index as usize;
                    if index >= items.len() {
                        if index - items.len() > MAX_DENSE_GAP {
                            return Err(EngineError::new(
                                EngineStatus::InvalidArg,
                                format!(
                                    "RangeError: index {index} is too far past the array end ({})",
                                    items.len()
                                ),
                            ));
                        }
                        items.resize(index + 1, Val::Undefined);
                    }
                    items[index] = val;
                    return Ok(());
                }
            }
            heap.write_named(&target, &index.to_string(), val)
        })
    }

    fn array_length(&self, object: RawValue) -> EngineResult<u32> {
        self.with_heap(|heap| {
            let o = heap.object_of(object, "length")?;
            match &heap.obj(o)?.kind {
                ObjKind::Array(items) => Ok(items.len() as u32),
                _ => Err(EngineError::new(
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
        let (token, frame) = self.with_heap(|heap| {
            let target = heap.handles.get(function)?;
            let (name, token) = match &target {
                Val::Object(o) => match &heap.obj(*o)?.kind {
                    ObjKind::Function { name, token } => (name.clone(), *token),
                    _ => return Err(not_a_function(&target)),
                },
                _ => return Err(not_a_function(&target)),
            };
            let frame = heap.handles.open(true);
            heap.call_stack.push(EngineFrame::native(name));
            Ok((token, frame))
        })?;

        // No borrow is held here: the host may re-enter the engine.
        let outcome = host.invoke(token, this, args);

        let mut heap = self.heap.borrow_mut();
        let result = match outcome {
            Ok(raw) => heap
                .handles
                .escape(frame, raw)
                .map_err(|err| heap.annotate(err)),
            Err(err) => Err(heap.annotate(err)),
        };
        let leaked = heap.handles.unwind_to(frame);
        if leaked > 0 {
            tracing::warn!(leaked, "host callback returned with handle scopes still open");
        }
        heap.call_stack.pop();
        result
    }

    fn coerce_to_string(&self, value: RawValue) -> EngineResult<String> {
        self.with_heap(|heap| {
            let val = heap.handles.get(value)?;
            heap.to_display_string(&val, &mut Vec::new())
        })
    }

    fn coerce_to_number(&self, value: RawValue) -> EngineResult<f64> {
        self.with_heap(|heap| {
            let val = heap.handles.get(value)?;
            heap.to_number(&val)
        })
    }

    fn coerce_to_bool(&self, value: RawValue) -> EngineResult<bool> {
        self.with_heap(|heap| Ok(heap.handles.get(value)?.truthy()))
    }

    fn get_value_string(&self, value: RawValue) -> EngineResult<String> {
        self.with_heap(|heap| match heap.handles.get(value)? {
            Val::Str(s) => Ok(s.to_string()),
            other => Err(EngineError::new(
                EngineStatus::StringExpected,
                format!("expected a string, got {}", other.describe()),
            )),
        })
    }

    fn get_value_f64(&self, value: RawValue) -> EngineResult<f64> {
        self.with_heap(|heap| match heap.handles.get(value)? {
            Val::Number(n) => Ok(n),
            other => Err(EngineError::new(
                EngineStatus::NumberExpected,
                format!("expected a number, got {}", other.describe()),
            )),
        })
    }

    fn get_value_bool(&self, value: RawValue) -> EngineResult<bool> {
        self.with_heap(|heap| match heap.handles.get(value)? {
            Val::Bool(b) => Ok(b),
            other => Err(EngineError::new(
                EngineStatus::BooleanExpected,
                format!("expected a boolean, got {}", other.describe()),
            )),
        })
    }

    fn create_reference(&self, value: RawValue, initial_count: u32) -> EngineResult<RawRef> {
        self.with_heap(|heap| {
            let target = heap.handles.get(value)?;
            let id = heap.next_ref;
            heap.next_ref += 1;
            heap.refs.insert(
                id,
                RefSlot {
                    target,
                    count: initial_count,
                },
            );
            Ok(RawRef(id))
        })
    }

    fn reference_ref(&self, reference: RawRef) -> EngineResult<u32> {
        self.with_heap(|heap| {
            let slot = ref_slot(heap, reference)?;
            slot.count += 1;
            Ok(slot.count)
        })
    }

    fn reference_unref(&self, reference: RawRef) -> EngineResult<u32> {
        self.with_heap(|heap| {
            let slot = ref_slot(heap, reference)?;
            if slot.count == 0 {
                return Err(EngineError::new(
                    EngineStatus::GenericFailure,
                    format!("reference {} is already weak", reference.0),
                ));
            }
            slot.count -= 1;
            Ok(slot.count)
        })
    }

    fn reference_value(&self, reference: RawRef) -> EngineResult<Option<RawValue>> {
        self.with_heap(|heap| {
            let target = ref_slot(heap, reference)?.target.clone();
            if let Val::Object(o) = &target {
                if !heap.alive(*o) {
                    return Ok(None);
                }
            }
            Ok(Some(heap.handles.alloc(target)))
        })
    }

    fn delete_reference(&self, reference: RawRef) -> EngineResult<()> {
        self.with_heap(|heap| {
            heap.refs.remove(&reference.0).map(|_| ()).ok_or_else(|| {
                EngineError::new(
                    EngineStatus::InvalidArg,
                    format!("reference {} does not exist", reference.0),
                )
            })
        })
    }

    fn capture_stack(&self) -> Vec<EngineFrame> {
        self.heap.borrow().snapshot()
    }

    fn collect_garbage(&self) {
        let freed = self.heap.borrow_mut().collect();
        tracing::debug!(freed, "heap engine collected garbage");
    }
}

fn ref_slot(heap: &mut Heap, reference: RawRef) -> EngineResult<&mut RefSlot> {
    heap.refs.get_mut(&reference.0).ok_or_else(|| {
        EngineError::new(
            EngineStatus::InvalidArg,
            format!("reference {} does not exist", reference.0),
        )
    })
}

fn not_a_function(target: &Val) -> EngineError {
    EngineError::new(
        EngineStatus::FunctionExpected,
        format!("TypeError: {} is not a function", target.describe()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Echo {
        calls: Cell<usize>,
    }

    impl CallbackHost for Echo {
        fn invoke(
            &self,
            token: CallbackToken,
            _this: RawValue,
            args: &[RawValue],
        ) -> EngineResult<RawValue> {
            self.calls.set(self.calls.get() + 1);
            match token.0 {
                1 => Ok(args.first().copied().unwrap_or(RawValue::UNDEFINED)),
                _ => Err(EngineError::new(EngineStatus::PendingException, "boom")),
            }
        }
    }

    #[test]
    fn test_properties_round_trip_through_handles() {
        let engine = HeapEngine::new();
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
        let engine = HeapEngine::new();
        let err = engine
            .get_named_property(RawValue::UNDEFINED, "name")
            .unwrap_err();
        assert_eq!(err.status, EngineStatus::ObjectExpected);
        assert!(err.message.contains("reading 'name'"));
    }

    #[test]
    fn test_call_escapes_result_and_records_stack() {
        let engine = HeapEngine::new();
        let host = Rc::new(Echo {
            calls: Cell::new(0),
        });
        let echo = engine.function("echo", CallbackToken(1)).unwrap();
        let arg = engine.string("hi").unwrap();
        let out = engine
            .call_function(host.clone(), echo, RawValue::UNDEFINED, &[arg])
            .unwrap();
        assert_eq!(engine.get_value_string(out).unwrap(), "hi");

        let fail = engine.function("fail", CallbackToken(2)).unwrap();
        let err = engine
            .call_function(host.clone(), fail, RawValue::UNDEFINED, &[])
            .unwrap_err();
        assert_eq!(err.stack, vec![EngineFrame::native("fail")]);
        assert_eq!(host.calls.get(), 2);
        assert_eq!(engine.open_handle_scopes(), 0);
    }

    #[test]
    fn test_weak_reference_cleared_by_collection() {
        let engine = HeapEngine::new();
        let scope = engine.open_handle_scope(false).unwrap();
        let obj = engine.object().unwrap();
        let weak = engine.create_reference(obj, 0).unwrap();
        let strong = engine.create_reference(obj, 1).unwrap();
        engine.close_handle_scope(scope).unwrap();

        engine.collect_garbage();
        // Resolve inside a region so the lookup handle does not root the object
        let lookup = engine.open_handle_scope(false).unwrap();
        assert!(engine.reference_value(weak).unwrap().is_some());
        engine.close_handle_scope(lookup).unwrap();

        engine.reference_unref(strong).unwrap();
        engine.collect_garbage();
        assert!(engine.reference_value(weak).unwrap().is_none());
        assert!(engine.reference_value(strong).unwrap().is_none());
    }

    #[test]
    fn test_coercions_follow_engine_rules() {
        let engine = HeapEngine::new();
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
    }

    #[test]
    fn test_far_element_write_is_rejected() {
        let engine = HeapEngine::new();
        let arr = engine.array().unwrap();
        let one = engine.number(1.0).unwrap();
        let err = engine.set_element(arr, u32::MAX - 1, one).unwrap_err();
        assert_eq!(err.status, EngineStatus::InvalidArg);
        assert_eq!(engine.array_length(arr).unwrap(), 0);

        engine.set_element(arr, 9, one).unwrap();
        assert_eq!(engine.array_length(arr).unwrap(), 10);
    }

    #[test]
    fn test_self_referencing_array_joins_once() {
        let engine = HeapEngine::new();
        let arr = engine.array().unwrap();
        let tail = engine.string("x").unwrap();
        engine.set_element(arr, 0, arr).unwrap();
        engine.set_element(arr, 1, arr).unwrap();
        engine.set_element(arr, 2, tail).unwrap();
        assert_eq!(engine.coerce_to_string(arr).unwrap(), ",,x");
    }
}
