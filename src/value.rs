//! Lua value types.
//!
//! Heap-allocated objects live behind `Rc` handles; tables and coroutines
//! additionally get `RefCell` interior mutability, which gives the shared
//! mutable state semantics the language requires. Strings are immutable byte
//! sequences and need no cell.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::chunk::FunctionProto;
use crate::error::{LuaError, LuaResult};
use crate::table::Table;
use crate::vm::{Coroutine, ExecutionContext};

/// A host function callable from Lua: receives the execution context and the
/// argument tuple, returns a result tuple.
pub type CFunction = fn(&mut ExecutionContext<'_>, Vec<Value>) -> LuaResult<Vec<Value>>;

/// Handle to an immutable Lua string.
pub type StringHandle = Rc<LuaString>;

/// Handle to a shared mutable table.
pub type TableHandle = Rc<RefCell<Table>>;

/// Handle to a closure (immutable once built; its up-value cells are not).
pub type ClosureHandle = Rc<Closure>;

/// Handle to a coroutine.
pub type CoroutineHandle = Rc<RefCell<Coroutine>>;

/// Handle to an up-value cell.
pub type UpvalueHandle = Rc<RefCell<UpvalueState>>;

/// A frame's register file. Heap-allocated and reference-counted so open
/// up-value cells can alias registers of a frame that may have returned.
pub type RegisterFile = Rc<RefCell<Vec<Value>>>;

/// Main Lua value type.
#[derive(Clone)]
pub enum Value {
    /// nil
    Nil,

    /// true / false
    Boolean(bool),

    /// 64-bit float; the only number representation at runtime
    Number(f64),

    /// immutable byte string
    String(StringHandle),

    /// table
    Table(TableHandle),

    /// host-supplied function
    Function(CFunction),

    /// Lua function: prototype + captured up-values
    Closure(ClosureHandle),

    /// coroutine
    Coroutine(CoroutineHandle),
}

impl Value {
    /// Build a string value from text.
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(Rc::new(LuaString::from_str(&s.into())))
    }

    /// The Lua type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) | Value::Closure(_) => "function",
            Value::Coroutine(_) => "thread",
        }
    }

    /// Check if this value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truthiness: everything except `nil` and `false`.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Check if the value is callable without a `__call` metamethod.
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Closure(_))
    }

    /// Number coercion: numbers pass through, strings parse per the Lua
    /// lexer (decimal or `0x` hex, surrounding whitespace ignored).
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => parse_number(s.to_str().ok()?),
            _ => None,
        }
    }

    /// String coercion as used by concatenation: strings pass through,
    /// numbers format to decimal text. Everything else is `None`.
    pub fn coerce_string(&self) -> Option<Vec<u8>> {
        match self {
            Value::String(s) => Some(s.as_bytes().to_vec()),
            Value::Number(n) => Some(format_number(*n).into_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => match s.to_str() {
                Ok(text) => write!(f, "{}", text),
                Err(_) => write!(f, "{}", String::from_utf8_lossy(s.as_bytes())),
            },
            Value::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Value::Function(c) => write!(f, "function: {:p}", *c as *const ()),
            Value::Closure(c) => write!(f, "function: {:p}", Rc::as_ptr(c)),
            Value::Coroutine(c) => write!(f, "thread: {:p}", Rc::as_ptr(c)),
        }
    }
}

// Shallow Debug: reference types print as pointers so cyclic structures
// cannot recurse the formatter.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Value::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Value::String(s) => write!(f, "String({:?})", String::from_utf8_lossy(s.as_bytes())),
            Value::Table(t) => write!(f, "Table({:p})", Rc::as_ptr(t)),
            Value::Function(c) => write!(f, "Function({:p})", *c as *const ()),
            Value::Closure(c) => write!(f, "Closure({:p})", Rc::as_ptr(c)),
            Value::Coroutine(c) => write!(f, "Coroutine({:p})", Rc::as_ptr(c)),
        }
    }
}

/// Raw (metamethod-free) equality: primitives by value, strings by bytes,
/// reference types by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => {
                Rc::ptr_eq(a, b) || a.as_bytes() == b.as_bytes()
            }
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => {
                std::ptr::eq(*a as *const (), *b as *const ())
            }
            (Value::Coroutine(a), Value::Coroutine(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An immutable Lua string: a byte sequence with a cached content hash.
#[derive(Debug, Clone)]
pub struct LuaString {
    bytes: Vec<u8>,
    content_hash: u64,
}

impl LuaString {
    /// Create from text.
    pub fn from_str(s: &str) -> LuaString {
        LuaString::from_bytes(s.as_bytes().to_vec())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> LuaString {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        LuaString {
            content_hash: hasher.finish(),
            bytes,
        }
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode as UTF-8 if possible.
    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the string holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for LuaString {
    fn eq(&self, other: &Self) -> bool {
        self.content_hash == other.content_hash && self.bytes == other.bytes
    }
}

impl Eq for LuaString {}

impl Hash for LuaString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_hash.hash(state);
    }
}

/// Wrapper for f64 with bit-level Eq and Hash, for use as a table key.
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl Hash for OrderedFloat {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A table key. Any non-nil value can key a table; reference types compare
/// and hash by identity, keeping the original handle alive so traversal can
/// hand the key back out.
#[derive(Debug, Clone)]
pub enum HashableValue {
    /// boolean key
    Boolean(bool),

    /// number key (bit-compared; NaN is rejected before it gets here)
    Number(OrderedFloat),

    /// string key, compared by content
    Str(StringHandle),

    /// table key, by identity
    Table(TableHandle),

    /// closure key, by identity
    Closure(ClosureHandle),

    /// host function key, by pointer
    Function(CFunction),

    /// coroutine key, by identity
    Coroutine(CoroutineHandle),
}

impl HashableValue {
    /// Convert a value to a key. `nil` and NaN are not valid keys.
    pub fn from_value(value: &Value) -> LuaResult<HashableValue> {
        match value {
            Value::Nil => Err(LuaError::Runtime("table index is nil".to_string())),
            Value::Boolean(b) => Ok(HashableValue::Boolean(*b)),
            Value::Number(n) => {
                if n.is_nan() {
                    Err(LuaError::Runtime("table index is NaN".to_string()))
                } else {
                    Ok(HashableValue::Number(OrderedFloat(*n)))
                }
            }
            Value::String(s) => Ok(HashableValue::Str(Rc::clone(s))),
            Value::Table(t) => Ok(HashableValue::Table(Rc::clone(t))),
            Value::Closure(c) => Ok(HashableValue::Closure(Rc::clone(c))),
            Value::Function(f) => Ok(HashableValue::Function(*f)),
            Value::Coroutine(c) => Ok(HashableValue::Coroutine(Rc::clone(c))),
        }
    }

    /// Convert back to a Lua value.
    pub fn to_value(&self) -> Value {
        match self {
            HashableValue::Boolean(b) => Value::Boolean(*b),
            HashableValue::Number(n) => Value::Number(n.0),
            HashableValue::Str(s) => Value::String(Rc::clone(s)),
            HashableValue::Table(t) => Value::Table(Rc::clone(t)),
            HashableValue::Closure(c) => Value::Closure(Rc::clone(c)),
            HashableValue::Function(f) => Value::Function(*f),
            HashableValue::Coroutine(c) => Value::Coroutine(Rc::clone(c)),
        }
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HashableValue::Boolean(a), HashableValue::Boolean(b)) => a == b,
            (HashableValue::Number(a), HashableValue::Number(b)) => a == b,
            (HashableValue::Str(a), HashableValue::Str(b)) => {
                Rc::ptr_eq(a, b) || a.as_bytes() == b.as_bytes()
            }
            (HashableValue::Table(a), HashableValue::Table(b)) => Rc::ptr_eq(a, b),
            (HashableValue::Closure(a), HashableValue::Closure(b)) => Rc::ptr_eq(a, b),
            (HashableValue::Function(a), HashableValue::Function(b)) => {
                std::ptr::eq(*a as *const (), *b as *const ())
            }
            (HashableValue::Coroutine(a), HashableValue::Coroutine(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for HashableValue {}

impl Hash for HashableValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            HashableValue::Boolean(b) => b.hash(state),
            HashableValue::Number(n) => n.hash(state),
            HashableValue::Str(s) => s.hash(state),
            HashableValue::Table(t) => (Rc::as_ptr(t) as usize).hash(state),
            HashableValue::Closure(c) => (Rc::as_ptr(c) as usize).hash(state),
            HashableValue::Function(f) => (*f as usize).hash(state),
            HashableValue::Coroutine(c) => (Rc::as_ptr(c) as usize).hash(state),
        }
    }
}

/// A Lua function value: prototype plus captured up-value cells. Two
/// closures created at the same source point in the same frame share cells.
pub struct Closure {
    /// The compiled function.
    pub proto: Rc<FunctionProto>,

    /// Captured up-values, one cell per prototype up-value slot.
    pub upvalues: Vec<UpvalueHandle>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("proto", &self.proto.source)
            .field("upvalues", &self.upvalues.len())
            .finish()
    }
}

/// An up-value cell. Open cells alias a register of a live frame's register
/// file; closed cells own their value. The open-to-closed transition is
/// one-way.
pub enum UpvalueState {
    /// Aliases `regs[index]` of some frame.
    Open {
        /// The frame's register file.
        regs: RegisterFile,
        /// Register index within it.
        index: usize,
    },

    /// Owns the captured value.
    Closed(Value),
}

impl UpvalueState {
    /// Read through the cell.
    pub fn get(&self) -> Value {
        match self {
            UpvalueState::Open { regs, index } => regs
                .borrow()
                .get(*index)
                .cloned()
                .unwrap_or(Value::Nil),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    /// Write through the cell.
    pub fn set(&mut self, value: Value) {
        match self {
            UpvalueState::Open { regs, index } => {
                let mut regs = regs.borrow_mut();
                if *index >= regs.len() {
                    regs.resize(*index + 1, Value::Nil);
                }
                regs[*index] = value;
            }
            UpvalueState::Closed(slot) => *slot = value,
        }
    }

    /// Capture the current value and detach from the register file.
    pub fn close(&mut self) {
        if let UpvalueState::Open { .. } = self {
            let value = self.get();
            *self = UpvalueState::Closed(value);
        }
    }

    /// True while the cell still aliases a register.
    pub fn is_open(&self) -> bool {
        matches!(self, UpvalueState::Open { .. })
    }
}

impl fmt::Debug for UpvalueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpvalueState::Open { index, .. } => write!(f, "Open[{}]", index),
            UpvalueState::Closed(value) => write!(f, "Closed[{}]", value.type_name()),
        }
    }
}

/// Format a number the way Lua prints one: integral values without a
/// fractional part, non-finite values as `inf`/`nan`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// Parse a number literal the way the Lua lexer would: optional surrounding
/// whitespace, optional sign, `0x` hex or decimal/exponent form.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        let parsed = u64::from_str_radix(hex, 16).ok()?;
        return Some(sign * parsed as f64);
    }
    rest.parse::<f64>().ok().map(|n| sign * n)
}
