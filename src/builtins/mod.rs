pub mod format;

use std::borrow::Cow;
use std::cmp::Ordering;
use std::io::{BufRead, Write};
use std::num::IntErrorKind;

pub use format::ValueFormatter;

use crate::heap::{Handle, ObjArray, ObjRangeIterator, ObjectHeap};
use crate::value::{ErrorKind, Value, ValueType};

/// Longest slice of an offending string quoted back in a parse error.
const PREVIEW_LIMIT: usize = 48;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BuiltinError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BuiltinError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BuiltinError { kind, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("{0}")]
    Overflow(String),
    #[error("{0}")]
    Invalid(String),
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::Overflow(_) => ErrorKind::Value,
            ParseError::Invalid(_) => ErrorKind::Conversion,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ParseError::Overflow(m) | ParseError::Invalid(m) => m,
        }
    }
}

impl From<ParseError> for BuiltinError {
    fn from(e: ParseError) -> Self {
        BuiltinError::new(e.kind(), e.message())
    }
}

fn io_error(e: std::io::Error) -> BuiltinError {
    BuiltinError::new(ErrorKind::Io, e.to_string())
}

// ── print ────────────────────────────────────────────────────────────

/// Writes `values` and flushes. A leading string is treated as a template;
/// values it does not consume follow, separated by spaces.
pub fn print(out: &mut dyn Write, fmt: &ValueFormatter<'_>, values: &[Value], newline: bool) -> Result<(), BuiltinError> {
    let mut text = String::new();
    if let Some((&Value::String(h), args)) = values.split_first() {
        let template = fmt.heap().string_text(h).map_err(|e| BuiltinError::new(ErrorKind::Runtime, e.to_string()))?;
        let used = fmt.write_template(&mut text, &template, args);
        for value in &args[used..] {
            text.push(' ');
            fmt.write(&mut text, *value);
        }
    } else {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                text.push(' ');
            }
            fmt.write(&mut text, *value);
        }
    }
    if newline {
        text.push('\n');
    }
    out.write_all(text.as_bytes()).map_err(io_error)?;
    out.flush().map_err(io_error)
}

// ── range ────────────────────────────────────────────────────────────

fn range_bound(value: Value, position: &str) -> Result<i64, BuiltinError> {
    match value {
        Value::U64(n) => i64::try_from(n).map_err(|_| {
            BuiltinError::new(ErrorKind::Value, format!("range() {position} {n} is out of range for i64"))
        }),
        other => other.as_i64().ok_or_else(|| {
            BuiltinError::new(
                ErrorKind::Type,
                format!("range() {position} must be an integer, got {}", other.value_type()),
            )
        }),
    }
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
pub fn range(args: &[Value]) -> Result<ObjRangeIterator, BuiltinError> {
    let (start, end, step) = match *args {
        [stop] => (0, range_bound(stop, "stop")?, 1),
        [start, stop] => (range_bound(start, "start")?, range_bound(stop, "stop")?, 1),
        [start, stop, step] => (
            range_bound(start, "start")?,
            range_bound(stop, "stop")?,
            range_bound(step, "step")?,
        ),
        _ => {
            return Err(BuiltinError::new(
                ErrorKind::Argument,
                format!("range() expects 1 to 3 arguments, got {}", args.len()),
            ));
        }
    };
    if step == 0 {
        return Err(BuiltinError::new(ErrorKind::Value, "range() step must not be zero"));
    }
    Ok(ObjRangeIterator { current: start, end, step })
}

// ── sorted ───────────────────────────────────────────────────────────

/// Sorted copy of a homogeneous array. The sort is stable, NaN sorts last
/// and strings compare bytewise.
pub fn sorted(heap: &ObjectHeap, array: Handle<ObjArray>) -> Result<Vec<Value>, BuiltinError> {
    let source = heap.get(array).map_err(|e| BuiltinError::new(ErrorKind::Runtime, e.to_string()))?;
    let mut items = source.items().to_vec();
    let Some(first) = items.first() else {
        return Ok(items);
    };
    let element_type = first.value_type();
    match element_type {
        ValueType::Bool | ValueType::I32 | ValueType::I64 | ValueType::U32 | ValueType::U64 | ValueType::F64 | ValueType::String => {}
        other => {
            return Err(BuiltinError::new(ErrorKind::Type, format!("sorted() cannot order {other} values")));
        }
    }
    if let Some(odd) = items.iter().find(|v| v.value_type() != element_type) {
        return Err(BuiltinError::new(
            ErrorKind::Type,
            format!("sorted() requires all elements to share a type, found {element_type} and {}", odd.value_type()),
        ));
    }

    if element_type == ValueType::String {
        // flatten every key once instead of per comparison
        let mut keyed = Vec::with_capacity(items.len());
        for value in items {
            if let Value::String(h) = value {
                let bytes = heap.get(h).map_err(|e| BuiltinError::new(ErrorKind::Runtime, e.to_string()))?.rope().flatten();
                keyed.push((bytes, value));
            }
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        return Ok(keyed.into_iter().map(|(_, v)| v).collect());
    }

    items.sort_by(compare_scalars);
    Ok(items)
}

fn compare_scalars(a: &Value, b: &Value) -> Ordering {
    match (*a, *b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(&y),
        (Value::I32(x), Value::I32(y)) => x.cmp(&y),
        (Value::I64(x), Value::I64(y)) => x.cmp(&y),
        (Value::U32(x), Value::U32(y)) => x.cmp(&y),
        (Value::U64(x), Value::U64(y)) => x.cmp(&y),
        (Value::F64(x), Value::F64(y)) => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        },
        _ => Ordering::Equal,
    }
}

// ── input ────────────────────────────────────────────────────────────

/// Reads one line with the trailing `\n` or `\r\n` removed.
///
/// `prompt` is written to `out` first. With no prompt, `input> ` goes to
/// `err` when the session is interactive.
pub fn input(
    reader: &mut dyn BufRead,
    out: &mut dyn Write,
    err: &mut dyn Write,
    prompt: Option<&str>,
    interactive: bool,
) -> Result<String, BuiltinError> {
    match prompt {
        Some(p) => {
            out.write_all(p.as_bytes()).map_err(io_error)?;
            out.flush().map_err(io_error)?;
        }
        None => {
            out.flush().map_err(io_error)?;
            if interactive {
                err.write_all(b"input> ").map_err(io_error)?;
                err.flush().map_err(io_error)?;
            }
        }
    }

    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(io_error)?;
    if read == 0 {
        return Err(BuiltinError::new(ErrorKind::Eof, "input() reached end of input"));
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

// ── numeric parsing ──────────────────────────────────────────────────

fn preview(text: &str) -> Cow<'_, str> {
    if text.len() <= PREVIEW_LIMIT {
        return Cow::Borrowed(text);
    }
    let mut cut = PREVIEW_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    Cow::Owned(format!("{}...", &text[..cut]))
}

/// Converts an integer, a whole finite f64 or an integer string to i32.
pub fn parse_int(heap: &ObjectHeap, value: Value) -> Result<i32, ParseError> {
    let out_of_range = |shown: String| ParseError::Overflow(format!("int() overflow: {shown} is out of range for i32"));
    match value {
        Value::I32(n) => Ok(n),
        Value::I64(n) => i32::try_from(n).map_err(|_| out_of_range(n.to_string())),
        Value::U32(n) => i32::try_from(n).map_err(|_| out_of_range(n.to_string())),
        Value::U64(n) => i32::try_from(n).map_err(|_| out_of_range(n.to_string())),
        Value::F64(n) => {
            if !n.is_finite() {
                return Err(ParseError::Overflow("int() overflow: value is not finite".into()));
            }
            if n.fract() != 0.0 {
                return Err(ParseError::Invalid(format!("int() argument must be a whole number, got f64 {n}")));
            }
            if n < i32::MIN as f64 || n > i32::MAX as f64 {
                return Err(out_of_range(n.to_string()));
            }
            Ok(n as i32)
        }
        Value::String(h) => {
            let text = heap.string_text(h).map_err(|e| ParseError::Invalid(e.to_string()))?;
            match text.trim().parse::<i32>() {
                Ok(n) => Ok(n),
                Err(e) if matches!(e.kind(), IntErrorKind::PosOverflow | IntErrorKind::NegOverflow) => {
                    Err(ParseError::Overflow(format!(
                        "int() overflow: \"{}\" is out of range for i32",
                        preview(&text)
                    )))
                }
                Err(_) if text.contains(['.', 'e', 'E']) => Err(ParseError::Invalid(format!(
                    "int() argument must be an integer string (decimals are not allowed). \
                     Use float() to parse decimal values, got \"{}\"",
                    preview(&text)
                ))),
                Err(_) => Err(ParseError::Invalid(format!(
                    "int() argument must be an integer string, got \"{}\"",
                    preview(&text)
                ))),
            }
        }
        other => Err(ParseError::Invalid(format!(
            "int() argument must be a string or number, got {}",
            other.value_type()
        ))),
    }
}

/// Converts any numeric value or a numeric string to f64.
pub fn parse_float(heap: &ObjectHeap, value: Value) -> Result<f64, ParseError> {
    match value {
        Value::F64(n) => Ok(n),
        Value::I32(n) => Ok(n as f64),
        Value::I64(n) => Ok(n as f64),
        Value::U32(n) => Ok(n as f64),
        Value::U64(n) => Ok(n as f64),
        Value::String(h) => {
            let text = heap.string_text(h).map_err(|e| ParseError::Invalid(e.to_string()))?;
            match text.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(n),
                Ok(_) => Err(ParseError::Overflow(format!(
                    "float() overflow: \"{}\" is out of range for f64",
                    preview(&text)
                ))),
                Err(_) => Err(ParseError::Invalid(format!(
                    "float() argument must be a number, got \"{}\"",
                    preview(&text)
                ))),
            }
        }
        other => Err(ParseError::Invalid(format!(
            "float() argument must be a string or number, got {}",
            other.value_type()
        ))),
    }
}

// ── type inspection ──────────────────────────────────────────────────

/// Type label of `value`; enums report their declared type name.
pub fn type_of<'h>(heap: &'h ObjectHeap, value: Value) -> Cow<'h, str> {
    if let Value::Enum(h) = value {
        let name = heap.get(h).ok().and_then(|e| heap.string_text(e.type_name).ok());
        return match name {
            Some(name) if !name.is_empty() => name,
            _ => Cow::Borrowed("enum"),
        };
    }
    Cow::Borrowed(value.value_type().label())
}

/// True when `label` names the type of `value`. Error values also answer to
/// their combined `"<Kind>: <message>"` label.
pub fn is_type(heap: &ObjectHeap, value: Value, label: &str) -> bool {
    if type_of(heap, value) == label {
        return true;
    }
    match value {
        Value::Error(h) => heap.get(h).ok().is_some_and(|e| {
            heap.string_text(e.message)
                .is_ok_and(|message| format!("{}: {}", e.kind.name(), message) == label)
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ints(values: &[i32]) -> Vec<Value> {
        values.iter().map(|&n| Value::I32(n)).collect()
    }

    #[test]
    fn print_plain_values_space_separated() {
        let heap = ObjectHeap::new();
        let fmt = ValueFormatter::new(&heap, &[]);
        let mut out = Vec::new();
        print(&mut out, &fmt, &[Value::I32(1), Value::Bool(true)], true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1 true\n");
    }

    #[test]
    fn print_template_then_leftovers() {
        let mut heap = ObjectHeap::new();
        let t = heap.intern("x=@");
        let fmt = ValueFormatter::new(&heap, &[]);
        let mut out = Vec::new();
        print(&mut out, &fmt, &[Value::String(t), Value::I32(1), Value::I32(2)], false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "x=1 2");
    }

    #[test]
    fn print_template_with_oversized_precision() {
        let mut heap = ObjectHeap::new();
        let t = heap.intern("v=@.70000f w=@.3f");
        let fmt = ValueFormatter::new(&heap, &[]);
        let mut out = Vec::new();
        print(&mut out, &fmt, &[Value::String(t), Value::F64(1.5), Value::F64(0.25)], true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "v=1.5 w=0.250\n");
    }

    #[test]
    fn range_forms() {
        assert_eq!(range(&[Value::I32(5)]).unwrap(), ObjRangeIterator { current: 0, end: 5, step: 1 });
        assert_eq!(
            range(&[Value::I64(2), Value::U32(9), Value::I32(3)]).unwrap(),
            ObjRangeIterator { current: 2, end: 9, step: 3 }
        );
    }

    #[test]
    fn range_rejects_bad_arguments() {
        assert_eq!(range(&[]).unwrap_err().kind, ErrorKind::Argument);
        assert_eq!(range(&[Value::I32(0), Value::I32(4), Value::I32(0)]).unwrap_err().kind, ErrorKind::Value);
        assert_eq!(range(&[Value::F64(1.0)]).unwrap_err().kind, ErrorKind::Type);
        assert_eq!(range(&[Value::U64(u64::MAX)]).unwrap_err().kind, ErrorKind::Value);
    }

    #[test]
    fn sorted_is_stable_copy() {
        let mut heap = ObjectHeap::new();
        let arr = heap.alloc_array(ints(&[3, -1, 2, -1]));
        let out = sorted(&heap, arr).unwrap();
        assert_eq!(out, ints(&[-1, -1, 2, 3]));
        assert_eq!(heap.get(arr).unwrap().items(), ints(&[3, -1, 2, -1]).as_slice());
    }

    #[test]
    fn sorted_puts_nan_last() {
        let mut heap = ObjectHeap::new();
        let arr = heap.alloc_array(vec![Value::F64(f64::NAN), Value::F64(1.5), Value::F64(-2.0)]);
        let out = sorted(&heap, arr).unwrap();
        assert_eq!(out[0], Value::F64(-2.0));
        assert_eq!(out[1], Value::F64(1.5));
        assert!(matches!(out[2], Value::F64(n) if n.is_nan()));
    }

    #[test]
    fn sorted_strings_bytewise() {
        let mut heap = ObjectHeap::new();
        let (b, a, big) = (heap.alloc_string("b"), heap.alloc_string("a"), heap.alloc_string("B"));
        let arr = heap.alloc_array(vec![Value::String(b), Value::String(a), Value::String(big)]);
        let out = sorted(&heap, arr).unwrap();
        assert_eq!(out, vec![Value::String(big), Value::String(a), Value::String(b)]);
    }

    #[test]
    fn sorted_rejects_mixed_and_empty_is_fine() {
        let mut heap = ObjectHeap::new();
        let mixed = heap.alloc_array(vec![Value::I32(1), Value::I64(2)]);
        assert_eq!(sorted(&heap, mixed).unwrap_err().kind, ErrorKind::Type);
        let empty = heap.alloc_array(vec![]);
        assert!(sorted(&heap, empty).unwrap().is_empty());
    }

    #[test]
    fn input_strips_line_endings() {
        let mut reader = Cursor::new(b"hello\r\nworld\n".to_vec());
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let line = input(&mut reader, &mut out, &mut err, Some("> "), false).unwrap();
        assert_eq!(line, "hello");
        assert_eq!(out, b"> ");
        let line = input(&mut reader, &mut out, &mut err, None, true).unwrap();
        assert_eq!(line, "world");
        assert_eq!(err, b"input> ");
    }

    #[test]
    fn input_at_eof_is_an_error() {
        let mut reader = Cursor::new(Vec::new());
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let e = input(&mut reader, &mut out, &mut err, None, false).unwrap_err();
        assert_eq!(e.kind, ErrorKind::Eof);
    }

    #[test]
    fn input_last_line_without_newline() {
        let mut reader = Cursor::new(b"tail".to_vec());
        let (mut out, mut err) = (Vec::new(), Vec::new());
        assert_eq!(input(&mut reader, &mut out, &mut err, None, false).unwrap(), "tail");
    }

    #[test]
    fn parse_int_from_numbers() {
        let heap = ObjectHeap::new();
        assert_eq!(parse_int(&heap, Value::I64(-5)), Ok(-5));
        assert_eq!(parse_int(&heap, Value::F64(12.0)), Ok(12));
        assert_eq!(
            parse_int(&heap, Value::I64(1 << 40)),
            Err(ParseError::Overflow("int() overflow: 1099511627776 is out of range for i32".into()))
        );
        assert_eq!(
            parse_int(&heap, Value::F64(1.5)),
            Err(ParseError::Invalid("int() argument must be a whole number, got f64 1.5".into()))
        );
        assert!(matches!(parse_int(&heap, Value::F64(f64::INFINITY)), Err(ParseError::Overflow(_))));
    }

    #[test]
    fn parse_int_from_strings() {
        let mut heap = ObjectHeap::new();
        let ok = heap.alloc_string("  -42 ");
        let big = heap.alloc_string("99999999999");
        let dec = heap.alloc_string("3.5");
        let junk = heap.alloc_string("abc");
        assert_eq!(parse_int(&heap, Value::String(ok)), Ok(-42));
        assert_eq!(
            parse_int(&heap, Value::String(big)),
            Err(ParseError::Overflow("int() overflow: \"99999999999\" is out of range for i32".into()))
        );
        assert!(parse_int(&heap, Value::String(dec)).unwrap_err().message().contains("decimals are not allowed"));
        assert_eq!(
            parse_int(&heap, Value::String(junk)),
            Err(ParseError::Invalid("int() argument must be an integer string, got \"abc\"".into()))
        );
        assert_eq!(
            parse_int(&heap, Value::Bool(true)),
            Err(ParseError::Invalid("int() argument must be a string or number, got bool".into()))
        );
    }

    #[test]
    fn long_strings_are_previewed() {
        let mut heap = ObjectHeap::new();
        let long = heap.alloc_string("x".repeat(100));
        let msg = parse_int(&heap, Value::String(long)).unwrap_err();
        assert!(msg.message().ends_with(&format!("{}...\"", "x".repeat(48))));
    }

    #[test]
    fn parse_float_cases() {
        let mut heap = ObjectHeap::new();
        let ok = heap.alloc_string(" 2.5 ");
        let huge = heap.alloc_string("1e400");
        let bad = heap.alloc_string("nope");
        assert_eq!(parse_float(&heap, Value::String(ok)), Ok(2.5));
        assert_eq!(parse_float(&heap, Value::U32(7)), Ok(7.0));
        assert!(matches!(parse_float(&heap, Value::String(huge)), Err(ParseError::Overflow(_))));
        assert!(matches!(parse_float(&heap, Value::String(bad)), Err(ParseError::Invalid(_))));
        assert_eq!(ParseError::Overflow(String::new()).kind(), ErrorKind::Value);
    }

    #[test]
    fn type_of_and_is_type() {
        let mut heap = ObjectHeap::new();
        let type_name = heap.intern("Color");
        let variant_name = heap.intern("Red");
        let e = heap.alloc(crate::heap::ObjEnum { type_name, variant_name, variant_index: 0, payload: vec![] });
        assert_eq!(type_of(&heap, Value::Enum(e)), "Color");
        assert_eq!(type_of(&heap, Value::U32(1)), "u32");
        assert!(is_type(&heap, Value::I32(1), "i32"));
        assert!(!is_type(&heap, Value::I32(1), "i64"));

        let err = heap.alloc_error(ErrorKind::Value, "boom", 1, 1);
        assert!(is_type(&heap, Value::Error(err), "error"));
        assert!(is_type(&heap, Value::Error(err), "ValueError: boom"));
        assert!(!is_type(&heap, Value::Error(err), "TypeError: boom"));
    }
}
