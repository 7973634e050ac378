// object.rs - Heap values, objects and the engine's coercion rules

use crate::engine::{CallbackToken, ValueKind};
use std::rc::Rc;

/// Index + generation into the object arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ObjRef {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub(crate) enum Val {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(ObjRef),
}

pub(crate) enum ObjKind {
    Plain,
    Array(Vec<Val>),
    Function { name: String, token: CallbackToken },
    Error,
}

pub(crate) struct HeapObject {
    pub kind: ObjKind,
    /// Insertion-ordered own properties.
    pub props: Vec<(String, Val)>,
}

impl HeapObject {
    pub fn new(kind: ObjKind) -> Self {
        Self {
            kind,
            props: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Val> {
        self.props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, val: Val) {
        match self.props.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = val,
            None => self.props.push((key.to_string(), val)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.props.len();
        self.props.retain(|(k, _)| k != key);
        self.props.len() != before
    }

    pub fn kind(&self) -> ValueKind {
        match self.kind {
            ObjKind::Function { .. } => ValueKind::Function,
            _ => ValueKind::Object,
        }
    }

    /// Every object reachable in one step, for marking.
    pub fn children(&self) -> impl Iterator<Item = ObjRef> + '_ {
        let elements: &[Val] = match &self.kind {
            ObjKind::Array(items) => items,
            _ => &[],
        };
        self.props
            .iter()
            .map(|(_, v)| v)
            .chain(elements.iter())
            .filter_map(|v| match v {
                Val::Object(o) => Some(*o),
                _ => None,
            })
    }
}

impl Val {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Val::Undefined => Some(ValueKind::Undefined),
            Val::Null => Some(ValueKind::Null),
            Val::Bool(_) => Some(ValueKind::Boolean),
            Val::Number(_) => Some(ValueKind::Number),
            Val::Str(_) => Some(ValueKind::String),
            // Objects need the arena to tell functions apart
            Val::Object(_) => None,
        }
    }

    pub fn strict_equals(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Undefined, Val::Undefined) | (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Number(a), Val::Number(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Object(a), Val::Object(b)) => a == b,
            _ => false,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Val::Undefined | Val::Null => false,
            Val::Bool(b) => *b,
            Val::Number(n) => *n != 0.0 && !n.is_nan(),
            Val::Str(s) => !s.is_empty(),
            Val::Object(_) => true,
        }
    }

    /// How the value reads inside an error message.
    pub fn describe(&self) -> String {
        match self {
            Val::Undefined => "undefined".to_string(),
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Number(n) => number_to_string(*n),
            Val::Str(s) => format!("\"{s}\""),
            Val::Object(_) => "object".to_string(),
        }
    }
}

pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub(crate) fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    // Rust accepts "inf" and "nan" spellings the engine does not
    if trimmed.bytes().any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E') {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_string_parsing() {
        assert_eq!(string_to_number("  12 "), 12.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x1f"), 31.0);
        assert_eq!(string_to_number("1e3"), 1000.0);
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("12px").is_nan());
    }

    #[test]
    fn test_strict_equality() {
        assert!(Val::Number(0.0).strict_equals(&Val::Number(-0.0)));
        assert!(!Val::Number(f64::NAN).strict_equals(&Val::Number(f64::NAN)));
        assert!(!Val::Null.strict_equals(&Val::Undefined));
        assert!(Val::Str("a".into()).strict_equals(&Val::Str("a".into())));
    }
}
