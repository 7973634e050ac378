//! The native engine surface the bridge is built on
//!
//! Everything here is expressed in opaque handles. An engine is single-threaded
//! and is only ever touched from the thread that created it; the bridge layers
//! scope and thread validation on top before any of these methods run.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Opaque handle to an engine value, valid inside the native handle region
/// it was created in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawValue(pub u64);

impl RawValue {
    /// Sentinel every engine must read as `undefined`.
    pub const UNDEFINED: RawValue = RawValue(0);

    pub fn is_undefined_sentinel(self) -> bool {
        self == Self::UNDEFINED
    }
}

impl Default for RawValue {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

/// Opaque handle to a native handle region.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawScope(pub u64);

/// Opaque handle to a persistent (scope-independent) reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RawRef(pub u64);

/// Key into the host's registered-callback table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallbackToken(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Function,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// Status codes an engine reports alongside a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    InvalidArg,
    ObjectExpected,
    FunctionExpected,
    StringExpected,
    NumberExpected,
    BooleanExpected,
    PendingException,
    HandleScopeMismatch,
    EscapeCalledTwice,
    GenericFailure,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One frame of the engine's own call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl EngineFrame {
    pub fn native(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            location: None,
        }
    }
}

/// A failure reported by the engine.
///
/// `stack` is the engine stack at the moment the failure was raised. `cause`
/// carries a host-side error that was thrown into the engine by a callback and
/// is now travelling back out.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub status: EngineStatus,
    pub message: String,
    pub stack: Vec<EngineFrame>,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl EngineError {
    pub fn new(status: EngineStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            stack: Vec::new(),
            cause: None,
        }
    }

    pub fn with_stack(mut self, stack: Vec<EngineFrame>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_cause(mut self, cause: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Entry point the engine uses to call into host code.
///
/// The engine must not hold any internal borrow while `invoke` runs: the host
/// is free to call back into the engine.
pub trait CallbackHost {
    fn invoke(
        &self,
        token: CallbackToken,
        this: RawValue,
        args: &[RawValue],
    ) -> EngineResult<RawValue>;
}

/// The native environment handle.
///
/// Handle regions nest strictly; values created while a region is open belong
/// to it and die when it closes unless escaped. References count like N-API
/// references: a count of zero is weak.
pub trait Engine {
    // --- handle regions -----------------------------------------------------
    fn open_handle_scope(&self, escapable: bool) -> EngineResult<RawScope>;
    fn close_handle_scope(&self, scope: RawScope) -> EngineResult<()>;
    fn escape_handle(&self, scope: RawScope, value: RawValue) -> EngineResult<RawValue>;

    // --- construction -------------------------------------------------------
    fn null(&self) -> EngineResult<RawValue>;
    fn boolean(&self, value: bool) -> EngineResult<RawValue>;
    fn number(&self, value: f64) -> EngineResult<RawValue>;
    fn string(&self, value: &str) -> EngineResult<RawValue>;
    fn object(&self) -> EngineResult<RawValue>;
    fn array(&self) -> EngineResult<RawValue>;
    fn function(&self, name: &str, token: CallbackToken) -> EngineResult<RawValue>;
    fn error(&self, message: &str) -> EngineResult<RawValue>;
    fn global(&self) -> EngineResult<RawValue>;

    // --- inspection ---------------------------------------------------------
    fn type_of(&self, value: RawValue) -> EngineResult<ValueKind>;
    fn is_array(&self, value: RawValue) -> EngineResult<bool>;
    fn strict_equals(&self, a: RawValue, b: RawValue) -> EngineResult<bool>;

    // --- properties and elements --------------------------------------------
    fn get_named_property(&self, object: RawValue, key: &str) -> EngineResult<RawValue>;
    fn set_named_property(&self, object: RawValue, key: &str, value: RawValue)
        -> EngineResult<()>;
    fn has_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool>;
    fn delete_named_property(&self, object: RawValue, key: &str) -> EngineResult<bool>;
    fn get_element(&self, object: RawValue, index: u32) -> EngineResult<RawValue>;
    fn set_element(&self, object: RawValue, index: u32, value: RawValue) -> EngineResult<()>;
    fn array_length(&self, object: RawValue) -> EngineResult<u32>;

    // --- calls --------------------------------------------------------------
    /// Call `function`. Host functions reached during the call, at any
    /// depth, are dispatched through `host`.
    fn call_function(
        &self,
        host: Rc<dyn CallbackHost>,
        function: RawValue,
        this: RawValue,
        args: &[RawValue],
    ) -> EngineResult<RawValue>;

    // --- coercion and extraction --------------------------------------------
    fn coerce_to_string(&self, value: RawValue) -> EngineResult<String>;
    fn coerce_to_number(&self, value: RawValue) -> EngineResult<f64>;
    fn coerce_to_bool(&self, value: RawValue) -> EngineResult<bool>;
    fn get_value_string(&self, value: RawValue) -> EngineResult<String>;
    fn get_value_f64(&self, value: RawValue) -> EngineResult<f64>;
    fn get_value_bool(&self, value: RawValue) -> EngineResult<bool>;

    // --- persistent references ----------------------------------------------
    fn create_reference(&self, value: RawValue, initial_count: u32) -> EngineResult<RawRef>;
    fn reference_ref(&self, reference: RawRef) -> EngineResult<u32>;
    fn reference_unref(&self, reference: RawRef) -> EngineResult<u32>;
    fn reference_value(&self, reference: RawRef) -> EngineResult<Option<RawValue>>;
    fn delete_reference(&self, reference: RawRef) -> EngineResult<()>;

    // --- diagnostics and collection -----------------------------------------
    fn capture_stack(&self) -> Vec<EngineFrame>;
    fn collect_garbage(&self);
}
