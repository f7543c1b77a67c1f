use super::Fault;
use crate::bytecode::Opcode;
use crate::value::{ErrorKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub(super) fn apply<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

/// The numeric kind an opcode family works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NumKind {
    I32,
    I64,
    U32,
    U64,
    F64,
}

impl NumKind {
    pub(super) fn label(self) -> &'static str {
        match self {
            NumKind::I32 => "i32",
            NumKind::I64 => "i64",
            NumKind::U32 => "u32",
            NumKind::U64 => "u64",
            NumKind::F64 => "f64",
        }
    }

    pub(super) fn mismatch(self) -> Fault {
        Fault::raise(ErrorKind::Type, format!("Operands must be {}", self.label()))
    }
}

macro_rules! checked_int {
    ($name:ident, $t:ty) => {
        pub(super) fn $name(op: ArithOp, a: $t, b: $t) -> Result<$t, Fault> {
            let result = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => {
                    if b == 0 {
                        return Err(Fault::raise(ErrorKind::Runtime, "Division by zero"));
                    }
                    a.checked_div(b)
                }
                ArithOp::Mod => {
                    if b == 0 {
                        return Err(Fault::raise(ErrorKind::Runtime, "Modulo by zero"));
                    }
                    a.checked_rem(b)
                }
            };
            result.ok_or_else(|| Fault::raise(ErrorKind::Value, "Integer overflow"))
        }
    };
}

checked_int!(int_i32, i32);
checked_int!(int_i64, i64);
checked_int!(int_u32, u32);
checked_int!(int_u64, u64);

/// f64 follows IEEE 754: division by zero yields an infinity or NaN.
pub(super) fn float(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }
}

/// Applies `op` to two values of kind `kind`.
pub(super) fn binary(kind: NumKind, op: ArithOp, a: Value, b: Value) -> Result<Value, Fault> {
    match (kind, a, b) {
        (NumKind::I32, Value::I32(x), Value::I32(y)) => int_i32(op, x, y).map(Value::I32),
        (NumKind::I64, Value::I64(x), Value::I64(y)) => int_i64(op, x, y).map(Value::I64),
        (NumKind::U32, Value::U32(x), Value::U32(y)) => int_u32(op, x, y).map(Value::U32),
        (NumKind::U64, Value::U64(x), Value::U64(y)) => int_u64(op, x, y).map(Value::U64),
        (NumKind::F64, Value::F64(x), Value::F64(y)) => Ok(Value::F64(float(op, x, y))),
        _ => Err(kind.mismatch()),
    }
}

pub(super) fn compare(kind: NumKind, op: CmpOp, a: Value, b: Value) -> Result<bool, Fault> {
    match (kind, a, b) {
        (NumKind::I32, Value::I32(x), Value::I32(y)) => Ok(op.apply(x, y)),
        (NumKind::I64, Value::I64(x), Value::I64(y)) => Ok(op.apply(x, y)),
        (NumKind::U32, Value::U32(x), Value::U32(y)) => Ok(op.apply(x, y)),
        (NumKind::U64, Value::U64(x), Value::U64(y)) => Ok(op.apply(x, y)),
        (NumKind::F64, Value::F64(x), Value::F64(y)) => Ok(op.apply(x, y)),
        _ => Err(kind.mismatch()),
    }
}

/// Register-addressed arithmetic family of `op`, if it is one.
pub(super) fn arith_family(op: Opcode) -> Option<(NumKind, ArithOp)> {
    use ArithOp::*;
    use NumKind::*;
    Some(match op {
        Opcode::AddI32R => (I32, Add),
        Opcode::SubI32R => (I32, Sub),
        Opcode::MulI32R => (I32, Mul),
        Opcode::DivI32R => (I32, Div),
        Opcode::ModI32R => (I32, Mod),
        Opcode::AddI64R => (I64, Add),
        Opcode::SubI64R => (I64, Sub),
        Opcode::MulI64R => (I64, Mul),
        Opcode::DivI64R => (I64, Div),
        Opcode::ModI64R => (I64, Mod),
        Opcode::AddU32R => (U32, Add),
        Opcode::SubU32R => (U32, Sub),
        Opcode::MulU32R => (U32, Mul),
        Opcode::DivU32R => (U32, Div),
        Opcode::ModU32R => (U32, Mod),
        Opcode::AddU64R => (U64, Add),
        Opcode::SubU64R => (U64, Sub),
        Opcode::MulU64R => (U64, Mul),
        Opcode::DivU64R => (U64, Div),
        Opcode::ModU64R => (U64, Mod),
        Opcode::AddF64R => (F64, Add),
        Opcode::SubF64R => (F64, Sub),
        Opcode::MulF64R => (F64, Mul),
        Opcode::DivF64R => (F64, Div),
        Opcode::ModF64R => (F64, Mod),
        _ => return None,
    })
}

/// Fast typed-bank arithmetic family of `op`.
pub(super) fn typed_arith_family(op: Opcode) -> Option<(NumKind, ArithOp)> {
    use ArithOp::*;
    use NumKind::*;
    Some(match op {
        Opcode::AddI32Typed => (I32, Add),
        Opcode::SubI32Typed => (I32, Sub),
        Opcode::MulI32Typed => (I32, Mul),
        Opcode::DivI32Typed => (I32, Div),
        Opcode::ModI32Typed => (I32, Mod),
        Opcode::AddI64Typed => (I64, Add),
        Opcode::SubI64Typed => (I64, Sub),
        Opcode::MulI64Typed => (I64, Mul),
        Opcode::DivI64Typed => (I64, Div),
        Opcode::ModI64Typed => (I64, Mod),
        Opcode::AddF64Typed => (F64, Add),
        Opcode::SubF64Typed => (F64, Sub),
        Opcode::MulF64Typed => (F64, Mul),
        Opcode::DivF64Typed => (F64, Div),
        _ => return None,
    })
}

pub(super) fn compare_family(op: Opcode) -> Option<(NumKind, CmpOp)> {
    use CmpOp::*;
    use NumKind::*;
    Some(match op {
        Opcode::LtI32R | Opcode::LtI32Typed => (I32, Lt),
        Opcode::LeI32R | Opcode::LeI32Typed => (I32, Le),
        Opcode::GtI32R | Opcode::GtI32Typed => (I32, Gt),
        Opcode::GeI32R | Opcode::GeI32Typed => (I32, Ge),
        Opcode::LtI64R => (I64, Lt),
        Opcode::LeI64R => (I64, Le),
        Opcode::GtI64R => (I64, Gt),
        Opcode::GeI64R => (I64, Ge),
        Opcode::LtU32R => (U32, Lt),
        Opcode::LeU32R => (U32, Le),
        Opcode::GtU32R => (U32, Gt),
        Opcode::GeU32R => (U32, Ge),
        Opcode::LtU64R => (U64, Lt),
        Opcode::LeU64R => (U64, Le),
        Opcode::GtU64R => (U64, Gt),
        Opcode::GeU64R => (U64, Ge),
        Opcode::LtF64R => (F64, Lt),
        Opcode::LeF64R => (F64, Le),
        Opcode::GtF64R => (F64, Gt),
        Opcode::GeF64R => (F64, Ge),
        _ => return None,
    })
}

fn conversion_error(from: &str, to: &str, shown: impl std::fmt::Display) -> Fault {
    Fault::raise(ErrorKind::Conversion, format!("cannot convert {from} {shown} to {to}"))
}

fn float_to_int<T: TryFrom<i64>>(n: f64, to: &str) -> Result<T, Fault> {
    let truncated = n.trunc();
    // i64 bounds: 2^63 is exactly representable, so the upper check is strict
    if !n.is_finite() || truncated < -9_223_372_036_854_775_808.0 || truncated >= 9_223_372_036_854_775_808.0 {
        return Err(conversion_error("f64", to, n));
    }
    T::try_from(truncated as i64).map_err(|_| conversion_error("f64", to, n))
}

/// Checked numeric conversion; out-of-range values raise a Conversion error.
pub(super) fn convert(op: Opcode, value: Value) -> Result<Value, Fault> {
    let expected = |label: &str| Fault::raise(ErrorKind::Type, format!("{} expects a {label} operand", op.mnemonic()));
    Ok(match op {
        Opcode::I32ToI64R => match value {
            Value::I32(n) => Value::I64(n as i64),
            _ => return Err(expected("i32")),
        },
        Opcode::I32ToF64R => match value {
            Value::I32(n) => Value::F64(n as f64),
            _ => return Err(expected("i32")),
        },
        Opcode::I32ToU32R => match value {
            Value::I32(n) => Value::U32(u32::try_from(n).map_err(|_| conversion_error("i32", "u32", n))?),
            _ => return Err(expected("i32")),
        },
        Opcode::I64ToI32R => match value {
            Value::I64(n) => Value::I32(i32::try_from(n).map_err(|_| conversion_error("i64", "i32", n))?),
            _ => return Err(expected("i64")),
        },
        Opcode::I64ToF64R => match value {
            Value::I64(n) => Value::F64(n as f64),
            _ => return Err(expected("i64")),
        },
        Opcode::I64ToU64R => match value {
            Value::I64(n) => Value::U64(u64::try_from(n).map_err(|_| conversion_error("i64", "u64", n))?),
            _ => return Err(expected("i64")),
        },
        Opcode::U32ToI32R => match value {
            Value::U32(n) => Value::I32(i32::try_from(n).map_err(|_| conversion_error("u32", "i32", n))?),
            _ => return Err(expected("u32")),
        },
        Opcode::U32ToF64R => match value {
            Value::U32(n) => Value::F64(n as f64),
            _ => return Err(expected("u32")),
        },
        Opcode::U64ToI64R => match value {
            Value::U64(n) => Value::I64(i64::try_from(n).map_err(|_| conversion_error("u64", "i64", n))?),
            _ => return Err(expected("u64")),
        },
        Opcode::U64ToF64R => match value {
            Value::U64(n) => Value::F64(n as f64),
            _ => return Err(expected("u64")),
        },
        Opcode::F64ToI32R => match value {
            Value::F64(n) => Value::I32(float_to_int(n, "i32")?),
            _ => return Err(expected("f64")),
        },
        Opcode::F64ToI64R => match value {
            Value::F64(n) => Value::I64(float_to_int(n, "i64")?),
            _ => return Err(expected("f64")),
        },
        Opcode::BoolToI32R => match value {
            Value::Bool(b) => Value::I32(b as i32),
            _ => return Err(expected("bool")),
        },
        Opcode::I32ToBoolR => match value {
            Value::I32(n) => Value::Bool(n != 0),
            _ => return Err(expected("i32")),
        },
        other => {
            return Err(Fault::raise(ErrorKind::Runtime, format!("{} is not a conversion", other.mnemonic())));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raised(fault: Fault) -> (ErrorKind, String) {
        match fault {
            Fault::Raise { kind, message } => (kind, message),
            other => panic!("expected a raised error, got {other:?}"),
        }
    }

    #[test]
    fn i32_overflow_is_a_value_error() {
        let (kind, msg) = raised(int_i32(ArithOp::Add, i32::MAX, 1).unwrap_err());
        assert_eq!(kind, ErrorKind::Value);
        assert_eq!(msg, "Integer overflow");
        assert!(int_i32(ArithOp::Mod, i32::MIN, -1).is_err());
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let (kind, msg) = raised(int_u64(ArithOp::Div, 1, 0).unwrap_err());
        assert_eq!(kind, ErrorKind::Runtime);
        assert_eq!(msg, "Division by zero");
        let (_, msg) = raised(int_i64(ArithOp::Mod, 1, 0).unwrap_err());
        assert_eq!(msg, "Modulo by zero");
    }

    #[test]
    fn unsigned_underflow() {
        assert!(int_u32(ArithOp::Sub, 0, 1).is_err());
        assert_eq!(int_u32(ArithOp::Sub, 3, 1).ok(), Some(2));
    }

    #[test]
    fn float_division_is_ieee() {
        assert_eq!(float(ArithOp::Div, 1.0, 0.0), f64::INFINITY);
        assert!(float(ArithOp::Mod, 1.0, 0.0).is_nan());
    }

    #[test]
    fn mismatched_operands() {
        let (kind, msg) = raised(binary(NumKind::I32, ArithOp::Add, Value::I32(1), Value::I64(1)).unwrap_err());
        assert_eq!(kind, ErrorKind::Type);
        assert_eq!(msg, "Operands must be i32");
    }

    #[test]
    fn conversions_are_checked() {
        assert_eq!(convert(Opcode::I32ToI64R, Value::I32(-3)).ok(), Some(Value::I64(-3)));
        assert_eq!(convert(Opcode::F64ToI32R, Value::F64(2.9)).ok(), Some(Value::I32(2)));
        let (kind, _) = raised(convert(Opcode::I64ToI32R, Value::I64(1 << 40)).unwrap_err());
        assert_eq!(kind, ErrorKind::Conversion);
        assert!(convert(Opcode::F64ToI64R, Value::F64(f64::NAN)).is_err());
        assert!(convert(Opcode::I32ToU32R, Value::I32(-1)).is_err());
        let (kind, _) = raised(convert(Opcode::U32ToF64R, Value::I32(1)).unwrap_err());
        assert_eq!(kind, ErrorKind::Type);
    }
}
