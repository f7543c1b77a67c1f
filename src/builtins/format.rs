use std::fmt::Write as _;

use crate::heap::{ObjArray, ObjectHeap};
use crate::value::Value;

/// Renders values for `print`, `TO_STRING_R` and the disassembler.
///
/// Function values are shown by name, so the formatter borrows the
/// program's function table alongside the heap.
pub struct ValueFormatter<'a> {
    heap: &'a ObjectHeap,
    functions: &'a [String],
}

impl<'a> ValueFormatter<'a> {
    pub fn new(heap: &'a ObjectHeap, functions: &'a [String]) -> Self {
        ValueFormatter { heap, functions }
    }

    pub fn heap(&self) -> &'a ObjectHeap {
        self.heap
    }

    pub fn format(&self, value: Value) -> String {
        let mut out = String::new();
        self.write(&mut out, value);
        out
    }

    pub fn write(&self, out: &mut String, value: Value) {
        let mut open_arrays = Vec::new();
        self.write_nested(out, value, &mut open_arrays);
    }

    fn function_name(&self, index: u16) -> &str {
        self.functions.get(index as usize).map(String::as_str).unwrap_or("?")
    }

    fn write_nested(&self, out: &mut String, value: Value, open_arrays: &mut Vec<u32>) {
        match value {
            Value::Void => out.push_str("void"),
            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
            Value::I32(n) => push_display(out, n),
            Value::I64(n) => push_display(out, n),
            Value::U32(n) => push_display(out, n),
            Value::U64(n) => push_display(out, n),
            Value::F64(n) => push_display(out, n),
            Value::String(h) => match self.heap.get(h) {
                Ok(s) => out.push_str(&s.text()),
                Err(_) => out.push_str("<stale string>"),
            },
            Value::Array(h) => {
                // a cycle back to an array being printed is elided
                if open_arrays.contains(&h.index()) {
                    out.push_str("...");
                    return;
                }
                let Ok(array) = self.heap.get::<ObjArray>(h) else {
                    out.push_str("<stale array>");
                    return;
                };
                open_arrays.push(h.index());
                self.write_list(out, array.items(), open_arrays);
                open_arrays.pop();
            }
            Value::Enum(h) => match self.heap.get(h) {
                Ok(e) => {
                    let type_name = self.heap.string_text(e.type_name).unwrap_or_default();
                    let variant = self.heap.string_text(e.variant_name).unwrap_or_default();
                    let _ = write!(out, "{type_name}.{variant}");
                    if !e.payload.is_empty() {
                        out.push('(');
                        self.write_list(out, &e.payload, open_arrays);
                        out.push(')');
                    }
                }
                Err(_) => out.push_str("<stale enum>"),
            },
            Value::Error(h) => {
                let message = self
                    .heap
                    .get(h)
                    .ok()
                    .and_then(|e| self.heap.string_text(e.message).ok())
                    .unwrap_or_default();
                let _ = write!(out, "Error: {message}");
            }
            Value::RangeIterator(h) => match self.heap.get(h) {
                Ok(r) if r.step == 1 => {
                    let _ = write!(out, "range({}..{})", r.current, r.end);
                }
                Ok(r) => {
                    let _ = write!(out, "range({}..{} step={})", r.current, r.end, r.step);
                }
                Err(_) => out.push_str("<stale range>"),
            },
            Value::ArrayIterator(h) => match self.heap.get(h) {
                Ok(it) => {
                    let len = self.heap.get(it.array).map(ObjArray::len).unwrap_or(0);
                    let remaining = len.saturating_sub(it.index);
                    let _ = write!(out, "array_iter(index={}, remaining={remaining})", it.index);
                }
                Err(_) => out.push_str("<stale iterator>"),
            },
            Value::Function(index) => {
                let _ = write!(out, "<fn {}>", self.function_name(index));
            }
            Value::Closure(h) => {
                let name = self.heap.get(h).map(|c| self.function_name(c.function)).unwrap_or("?");
                let _ = write!(out, "<closure {name}>");
            }
        }
    }

    fn write_list(&self, out: &mut String, items: &[Value], open_arrays: &mut Vec<u32>) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.write_nested(out, *item, open_arrays);
        }
    }

    // ── print templates ──

    /// Expands `template`, consuming values from `args` for each `@`
    /// directive. Returns how many arguments were consumed.
    pub fn write_template(&self, out: &mut String, template: &str, args: &[Value]) -> usize {
        let mut consumed = 0;
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => {}
                },
                '@' => {
                    let mut spec = String::new();
                    match chars.peek() {
                        Some('.') => {
                            spec.push('.');
                            chars.next();
                            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                                spec.push(d);
                                chars.next();
                            }
                            if chars.peek() == Some(&'f') {
                                spec.push('f');
                                chars.next();
                            }
                        }
                        Some(&k) if matches!(k, 'x' | 'X' | 'b' | 'o') => {
                            spec.push(k);
                            chars.next();
                        }
                        _ => {}
                    }
                    match args.get(consumed) {
                        Some(&value) => {
                            consumed += 1;
                            self.write_directive(out, value, &spec);
                        }
                        None => {
                            out.push('@');
                            out.push_str(&spec);
                        }
                    }
                }
                _ => out.push(c),
            }
        }
        consumed
    }

    fn write_directive(&self, out: &mut String, value: Value, spec: &str) {
        let radix = match spec {
            "x" | "X" | "o" | "b" => spec,
            _ => "",
        };
        let bits = match value {
            // negative signed values print as 64-bit two's complement
            Value::I32(n) => Some(n as i64 as u64),
            Value::I64(n) => Some(n as u64),
            Value::U32(n) => Some(n as u64),
            Value::U64(n) => Some(n),
            _ => None,
        };
        match (bits, radix) {
            (Some(bits), "x") => push_display(out, format_args!("{bits:x}")),
            (Some(bits), "X") => push_display(out, format_args!("{bits:X}")),
            (Some(bits), "o") => push_display(out, format_args!("{bits:o}")),
            (Some(bits), "b") => push_display(out, format_args!("{bits:b}")),
            _ => match (value, fixed_precision(spec)) {
                (Value::F64(n), Some(precision)) => push_display(out, format_args!("{n:.precision$}")),
                _ => self.write(out, value),
            },
        }
    }
}

/// Widest `.N` a directive may ask for; anything larger prints in the
/// default form.
pub const MAX_FIXED_PRECISION: usize = 100;

/// Precision of a `.Nf` (or `.N`) directive.
fn fixed_precision(spec: &str) -> Option<usize> {
    let digits = spec.strip_prefix('.')?;
    let digits = digits.strip_suffix('f').unwrap_or(digits);
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok().filter(|&p| p <= MAX_FIXED_PRECISION)
}

fn push_display(out: &mut String, value: impl std::fmt::Display) {
    let _ = write!(out, "{value}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjRangeIterator;

    fn render(heap: &ObjectHeap, value: Value) -> String {
        ValueFormatter::new(heap, &[]).format(value)
    }

    fn template(heap: &ObjectHeap, text: &str, args: &[Value]) -> (String, usize) {
        let mut out = String::new();
        let used = ValueFormatter::new(heap, &[]).write_template(&mut out, text, args);
        (out, used)
    }

    #[test]
    fn scalars() {
        let heap = ObjectHeap::new();
        assert_eq!(render(&heap, Value::Bool(true)), "true");
        assert_eq!(render(&heap, Value::I32(-7)), "-7");
        assert_eq!(render(&heap, Value::U64(u64::MAX)), "18446744073709551615");
        assert_eq!(render(&heap, Value::F64(0.1)), "0.1");
        assert_eq!(render(&heap, Value::F64(2.0)), "2");
        assert_eq!(render(&heap, Value::Void), "void");
    }

    #[test]
    fn arrays_join_with_comma() {
        let mut heap = ObjectHeap::new();
        let s = heap.alloc_string("x");
        let arr = heap.alloc_array(vec![Value::I32(1), Value::String(s), Value::Bool(false)]);
        assert_eq!(render(&heap, Value::Array(arr)), "1, x, false");
    }

    #[test]
    fn self_containing_array_terminates() {
        let mut heap = ObjectHeap::new();
        let arr = heap.alloc_array(vec![Value::I32(1)]);
        heap.array_push(arr, Value::Array(arr)).unwrap();
        assert_eq!(render(&heap, Value::Array(arr)), "1, ...");
    }

    #[test]
    fn ranges_and_errors() {
        let mut heap = ObjectHeap::new();
        let r = heap.alloc(ObjRangeIterator { current: 0, end: 5, step: 1 });
        let stepped = heap.alloc(ObjRangeIterator { current: 0, end: 10, step: 3 });
        let err = heap.alloc_error(crate::value::ErrorKind::Value, "bad", 1, 1);
        assert_eq!(render(&heap, Value::RangeIterator(r)), "range(0..5)");
        assert_eq!(render(&heap, Value::RangeIterator(stepped)), "range(0..10 step=3)");
        assert_eq!(render(&heap, Value::Error(err)), "Error: bad");
    }

    #[test]
    fn functions_by_name() {
        let heap = ObjectHeap::new();
        let names = vec!["main".to_string(), "fib".to_string()];
        assert_eq!(ValueFormatter::new(&heap, &names).format(Value::Function(1)), "<fn fib>");
    }

    #[test]
    fn template_directives() {
        let heap = ObjectHeap::new();
        let (out, used) = template(&heap, "v=@ f=@.2f h=@x", &[Value::I32(3), Value::F64(3.14159), Value::I32(255)]);
        assert_eq!(out, "v=3 f=3.14 h=ff");
        assert_eq!(used, 3);
    }

    #[test]
    fn template_radix_forms() {
        let heap = ObjectHeap::new();
        let (out, _) = template(&heap, "@X @o @b", &[Value::U32(255), Value::I32(8), Value::I32(5)]);
        assert_eq!(out, "FF 10 101");
        let (out, _) = template(&heap, "@x", &[Value::I32(-1)]);
        assert_eq!(out, "ffffffffffffffff");
    }

    #[test]
    fn template_escapes_and_missing_args() {
        let heap = ObjectHeap::new();
        let (out, used) = template(&heap, r#"a\tb\\c\"d\qe @ @x"#, &[]);
        assert_eq!(out, "a\tb\\c\"dqe @ @x");
        assert_eq!(used, 0);
    }

    #[test]
    fn precision_is_capped() {
        let heap = ObjectHeap::new();
        let (out, _) = template(&heap, "@.100f", &[Value::F64(0.5)]);
        assert_eq!(out.len(), "0.".len() + MAX_FIXED_PRECISION);
        let (out, used) = template(&heap, "@.101f @.99999999999999999999999f", &[Value::F64(2.5), Value::F64(-1.0)]);
        assert_eq!(out, "2.5 -1");
        assert_eq!(used, 2);
    }

    #[test]
    fn precision_on_non_float_uses_default() {
        let heap = ObjectHeap::new();
        let (out, _) = template(&heap, "@.3f", &[Value::I32(4)]);
        assert_eq!(out, "4");
    }
}
