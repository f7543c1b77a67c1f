use serde::{Deserialize, Serialize};

use crate::heap::{
    Handle, ObjArray, ObjArrayIterator, ObjClosure, ObjEnum, ObjError, ObjKind, ObjRangeIterator,
    ObjRef, ObjString,
};

/// A register-sized VM value. Heap variants carry a handle, never an address.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Void,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    String(Handle<ObjString>),
    Array(Handle<ObjArray>),
    Enum(Handle<ObjEnum>),
    Error(Handle<ObjError>),
    RangeIterator(Handle<ObjRangeIterator>),
    ArrayIterator(Handle<ObjArrayIterator>),
    /// Index into the program's function table.
    Function(u16),
    Closure(Handle<ObjClosure>),
}

/// Runtime type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Void,
    Bool,
    I32,
    I64,
    U32,
    U64,
    F64,
    String,
    Array,
    Enum,
    Error,
    RangeIterator,
    ArrayIterator,
    Function,
    Closure,
}

impl ValueType {
    pub fn label(self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Bool => "bool",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::U32 => "u32",
            ValueType::U64 => "u64",
            ValueType::F64 => "f64",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Enum => "enum",
            ValueType::Error => "error",
            ValueType::RangeIterator => "range_iterator",
            ValueType::ArrayIterator => "array_iterator",
            ValueType::Function | ValueType::Closure => "function",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Void => ValueType::Void,
            Value::Bool(_) => ValueType::Bool,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::F64(_) => ValueType::F64,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Enum(_) => ValueType::Enum,
            Value::Error(_) => ValueType::Error,
            Value::RangeIterator(_) => ValueType::RangeIterator,
            Value::ArrayIterator(_) => ValueType::ArrayIterator,
            Value::Function(_) => ValueType::Function,
            Value::Closure(_) => ValueType::Closure,
        }
    }

    /// The heap object this value refers to, if any.
    pub fn obj_ref(&self) -> Option<ObjRef> {
        let (kind, index) = match self {
            Value::String(h) => (ObjKind::String, h.index()),
            Value::Array(h) => (ObjKind::Array, h.index()),
            Value::Enum(h) => (ObjKind::Enum, h.index()),
            Value::Error(h) => (ObjKind::Error, h.index()),
            Value::RangeIterator(h) => (ObjKind::RangeIterator, h.index()),
            Value::ArrayIterator(h) => (ObjKind::ArrayIterator, h.index()),
            Value::Closure(h) => (ObjKind::Closure, h.index()),
            _ => return None,
        };
        Some(ObjRef { kind, index })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Widens any integer variant to i64 when it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I32(n) => Some(n as i64),
            Value::I64(n) => Some(n),
            Value::U32(n) => Some(n as i64),
            Value::U64(n) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    /// Condition semantics for jumps: bools test directly, numbers test non-zero.
    pub fn truthy(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            Value::I32(n) => Some(n != 0),
            Value::I64(n) => Some(n != 0),
            Value::U32(n) => Some(n != 0),
            Value::U64(n) => Some(n != 0),
            _ => None,
        }
    }
}

/// Category of a runtime error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Runtime,
    Type,
    Name,
    Index,
    Key,
    Value,
    Conversion,
    Argument,
    Import,
    Attribute,
    Unimplemented,
    Syntax,
    Indent,
    Tab,
    Recursion,
    Io,
    Os,
    Eof,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Name => "NameError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Conversion => "ConversionError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Unimplemented => "UnimplementedError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Indent => "IndentError",
            ErrorKind::Tab => "TabError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::Io => "IOError",
            ErrorKind::Os => "OSError",
            ErrorKind::Eof => "EOFError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
