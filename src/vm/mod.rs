mod arith;
mod io;

use std::time::Instant;

use serde::Serialize;

pub use io::{SharedBuffer, VmIo};

use crate::builtins::{self, BuiltinError, ParseError, ValueFormatter};
use crate::bytecode::{CompiledProgram, Opcode};
use crate::config::VmConfig;
use crate::heap::gc::CollectionReport;
use crate::heap::{
    GarbageCollector, GcStats, Handle, HeapError, ObjArray, ObjArrayIterator, ObjClosure, ObjEnum, ObjError,
    ObjRangeIterator, ObjString, ObjectHeap,
};
use crate::strings::StringRope;
use crate::value::{ErrorKind, Value};
use arith::NumKind;

pub const REGISTER_COUNT: usize = 256;
pub const TYPED_REGISTER_COUNT: usize = 64;
/// First register saved and restored across calls; arguments land here.
pub const FRAME_WINDOW_START: usize = 64;
pub const GLOBAL_COUNT: usize = 256;
pub const MAX_FRAMES: usize = 256;
pub const MAX_TRY_DEPTH: usize = 16;
/// `TRY_BEGIN` catch register meaning "do not store the error".
pub const NO_CATCH_REGISTER: u8 = 0xFF;
/// Concatenations at least this long are kept as ropes.
const ROPE_THRESHOLD: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("no functions defined")]
    NoFunctionsDefined,
    #[error("undefined function: {name}")]
    UnknownFunction { name: String },
    #[error("no function at index {index}")]
    UndefinedFunction { index: u16 },
    #[error("{name} expects {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: u8, got: usize },
    #[error("unknown opcode 0x{op:02X} at offset {offset}")]
    UnknownOpcode { op: u8, offset: usize },
    #[error("truncated {mnemonic} at offset {offset}")]
    TruncatedInstruction { mnemonic: &'static str, offset: usize },
    #[error("constant index {index} out of range")]
    BadConstant { index: u16 },
    #[error("jump at offset {offset} leaves the chunk")]
    BadJump { offset: usize },
    #[error("registers R{start}..R{} do not exist", start + count)]
    RegisterWindow { start: usize, count: usize },
    #[error("stack overflow: more than {max} call frames")]
    StackOverflow { max: usize },
    #[error("more than {max} nested try blocks")]
    TryOverflow { max: usize },
    #[error("TRY_END without a matching TRY_BEGIN")]
    UnbalancedTry,
    #[error("typed register T{index} out of range")]
    TypedRegisterOutOfRange { index: u8 },
    #[error(transparent)]
    Heap(#[from] HeapError),
    /// `function` and `offset` name the instruction where no handler was found.
    #[error("{kind}: {message} at {line}:{column}")]
    Uncaught { kind: ErrorKind, message: String, line: u32, column: u32, function: String, offset: usize },
}

pub type VmResult<T> = Result<T, VmError>;

/// Why an instruction stopped early. Raised and thrown values are catchable;
/// fatal faults end the run.
#[derive(Debug)]
enum Fault {
    Raise { kind: ErrorKind, message: String },
    Throw(Value),
    Fatal(VmError),
}

impl Fault {
    fn raise(kind: ErrorKind, message: impl Into<String>) -> Self {
        Fault::Raise { kind, message: message.into() }
    }
}

impl From<VmError> for Fault {
    fn from(e: VmError) -> Self {
        Fault::Fatal(e)
    }
}

impl From<HeapError> for Fault {
    fn from(e: HeapError) -> Self {
        Fault::Fatal(VmError::Heap(e))
    }
}

impl From<BuiltinError> for Fault {
    fn from(e: BuiltinError) -> Self {
        Fault::Raise { kind: e.kind, message: e.message }
    }
}

impl From<ParseError> for Fault {
    fn from(e: ParseError) -> Self {
        Fault::raise(e.kind(), e.message())
    }
}

/// Counters for one VM, reported by `--stats`.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ExecStats {
    pub instructions: u64,
    pub calls: u64,
    pub max_frame_depth: usize,
    pub allocations: u64,
    pub errors_raised: u64,
}

/// Unboxed cache of R0..R63 for the `*_TYPED` instructions.
#[derive(Debug, Clone, Copy, Default)]
enum TypedSlot {
    #[default]
    Empty,
    I32(i32),
    I64(i64),
    F64(f64),
}

impl TypedSlot {
    fn of(value: Value) -> Self {
        match value {
            Value::I32(n) => TypedSlot::I32(n),
            Value::I64(n) => TypedSlot::I64(n),
            Value::F64(n) => TypedSlot::F64(n),
            _ => TypedSlot::Empty,
        }
    }

    fn read(self, kind: NumKind) -> Option<Value> {
        match (self, kind) {
            (TypedSlot::I32(n), NumKind::I32) => Some(Value::I32(n)),
            (TypedSlot::I64(n), NumKind::I64) => Some(Value::I64(n)),
            (TypedSlot::F64(n), NumKind::F64) => Some(Value::F64(n)),
            _ => None,
        }
    }
}

struct CallFrame {
    chunk: usize,
    /// Return address while a callee runs.
    ip: usize,
    result_reg: u8,
    closure: Option<Handle<ObjClosure>>,
    /// Caller's R64..R255, restored on return. Empty for the entry frame.
    saved_window: Vec<Value>,
}

struct TryHandler {
    frame_depth: usize,
    catch_reg: Option<u8>,
    chunk: usize,
    target: usize,
}

// ── VM ───────────────────────────────────────────────────────────────

pub struct Vm<'p> {
    program: &'p CompiledProgram,
    function_names: Vec<String>,
    heap: ObjectHeap,
    gc: GarbageCollector,
    config: VmConfig,
    registers: Vec<Value>,
    typed: [TypedSlot; TYPED_REGISTER_COUNT],
    globals: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<TryHandler>,
    last_error: Value,
    io: VmIo,
    stats: ExecStats,
    started: Instant,
    chunk: usize,
    ip: usize,
    instr_start: usize,
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        self.heap.release_all();
    }
}

impl<'p> Vm<'p> {
    /// `heap` must be the heap the program's constants were allocated in.
    pub fn new(program: &'p CompiledProgram, heap: ObjectHeap, config: VmConfig, io: VmIo) -> Self {
        Vm {
            program,
            function_names: program.chunks.iter().map(|c| c.name.clone()).collect(),
            heap,
            gc: GarbageCollector::new(&config),
            config,
            registers: vec![Value::Void; REGISTER_COUNT],
            typed: [TypedSlot::Empty; TYPED_REGISTER_COUNT],
            globals: vec![Value::Void; GLOBAL_COUNT],
            frames: Vec::with_capacity(64),
            handlers: Vec::with_capacity(MAX_TRY_DEPTH),
            last_error: Value::Void,
            io,
            stats: ExecStats::default(),
            started: Instant::now(),
            chunk: 0,
            ip: 0,
            instr_start: 0,
        }
    }

    /// Runs the entry function (the first chunk) with no arguments.
    pub fn run(&mut self) -> VmResult<Value> {
        if self.program.chunks.is_empty() {
            return Err(VmError::NoFunctionsDefined);
        }
        self.enter(0, &[])
    }

    pub fn call(&mut self, name: &str, args: &[Value]) -> VmResult<Value> {
        let index = self
            .program
            .func_index(name)
            .ok_or_else(|| VmError::UnknownFunction { name: name.to_string() })?;
        self.enter(index, args)
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ObjectHeap {
        &mut self.heap
    }

    pub fn register(&self, index: u8) -> Value {
        self.registers[index as usize]
    }

    pub fn global(&self, index: u8) -> Value {
        self.globals[index as usize]
    }

    /// The most recently raised error, caught or not.
    pub fn last_error(&self) -> Value {
        self.last_error
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats { allocations: self.heap.total_allocations(), ..self.stats }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    pub fn pause_gc(&mut self) {
        self.gc.pause();
    }

    pub fn resume_gc(&mut self) {
        self.gc.resume();
    }

    pub fn format_value(&self, value: Value) -> String {
        ValueFormatter::new(&self.heap, &self.function_names).format(value)
    }

    /// Full collection with the VM's current roots. `None` while paused.
    pub fn collect_garbage(&mut self) -> Option<CollectionReport> {
        let Vm { program, heap, gc, registers, globals, frames, last_error, .. } = self;
        let roots = registers
            .iter()
            .chain(globals.iter())
            .chain(frames.iter().flat_map(|f| f.saved_window.iter()))
            .copied()
            .chain(frames.iter().filter_map(|f| f.closure.map(Value::Closure)))
            .chain(std::iter::once(*last_error))
            .chain(program.constant_roots());
        gc.collect(heap, roots)
    }

    fn enter(&mut self, function: u16, args: &[Value]) -> VmResult<Value> {
        let chunk = self
            .program
            .chunks
            .get(function as usize)
            .ok_or(VmError::UndefinedFunction { index: function })?;
        if chunk.arity as usize != args.len() {
            return Err(VmError::ArityMismatch { name: chunk.name.clone(), expected: chunk.arity, got: args.len() });
        }
        if FRAME_WINDOW_START + args.len() > REGISTER_COUNT {
            return Err(VmError::RegisterWindow { start: FRAME_WINDOW_START, count: args.len() });
        }
        self.frames.clear();
        self.handlers.clear();
        for (i, &arg) in args.iter().enumerate() {
            self.set_reg(FRAME_WINDOW_START + i, arg);
        }
        self.frames.push(CallFrame {
            chunk: function as usize,
            ip: 0,
            result_reg: 0,
            closure: None,
            saved_window: Vec::new(),
        });
        self.chunk = function as usize;
        self.ip = 0;
        self.stats.calls += 1;
        self.stats.max_frame_depth = self.stats.max_frame_depth.max(1);

        let result = self.execute();
        self.frames.clear();
        self.handlers.clear();
        tracing::debug!(
            instructions = self.stats.instructions,
            calls = self.stats.calls,
            errors = self.stats.errors_raised,
            ok = result.is_ok(),
            "run finished"
        );
        result
    }

    fn execute(&mut self) -> VmResult<Value> {
        loop {
            match self.dispatch() {
                Ok(value) => return Ok(value),
                Err(fault) => self.handle_fault(fault)?,
            }
        }
    }

    // ── registers ──

    fn set_reg(&mut self, index: usize, value: Value) {
        self.registers[index] = value;
        if index < TYPED_REGISTER_COUNT {
            self.typed[index] = TypedSlot::of(value);
        }
    }

    fn typed_index(index: u8) -> Result<usize, VmError> {
        if (index as usize) < TYPED_REGISTER_COUNT {
            Ok(index as usize)
        } else {
            Err(VmError::TypedRegisterOutOfRange { index })
        }
    }

    fn typed_read(&self, index: u8, kind: NumKind) -> Result<Value, VmError> {
        let i = Self::typed_index(index)?;
        Ok(self.typed[i].read(kind).unwrap_or(self.registers[i]))
    }

    fn typed_write(&mut self, index: u8, value: Value) -> Result<(), VmError> {
        let i = Self::typed_index(index)?;
        self.set_reg(i, value);
        Ok(())
    }

    fn window(&self, start: u8, count: u8) -> Result<&[Value], VmError> {
        let (start, count) = (start as usize, count as usize);
        self.registers
            .get(start..start + count)
            .ok_or(VmError::RegisterWindow { start, count })
    }

    fn restore_window(&mut self, saved: &[Value]) {
        for (slot, &value) in self.registers[FRAME_WINDOW_START..].iter_mut().zip(saved) {
            *slot = value;
        }
    }

    fn condition(&self, index: u8) -> Result<bool, Fault> {
        let value = self.registers[index as usize];
        value.truthy().ok_or_else(|| {
            Fault::raise(ErrorKind::Type, format!("Condition must be bool or integer, got {}", value.value_type()))
        })
    }

    fn string_operand(&self, index: u8) -> Result<Handle<ObjString>, Fault> {
        match self.registers[index as usize] {
            Value::String(h) => Ok(h),
            other => Err(Fault::raise(ErrorKind::Type, format!("Expected string, got {}", other.value_type()))),
        }
    }

    fn array_operand(&self, index: u8) -> Result<Handle<ObjArray>, Fault> {
        match self.registers[index as usize] {
            Value::Array(h) => Ok(h),
            other => Err(Fault::raise(ErrorKind::Type, format!("Expected array, got {}", other.value_type()))),
        }
    }

    fn enum_operand(&self, index: u8) -> Result<&ObjEnum, Fault> {
        match self.registers[index as usize] {
            Value::Enum(h) => Ok(self.heap.get(h)?),
            other => Err(Fault::raise(ErrorKind::Type, format!("Expected enum, got {}", other.value_type()))),
        }
    }

    fn index_operand(&self, index: u8) -> Result<usize, Fault> {
        let value = self.registers[index as usize];
        match value.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            Some(n) => Err(Fault::raise(ErrorKind::Index, format!("Negative index {n}"))),
            None => Err(Fault::raise(ErrorKind::Type, format!("Index must be an integer, got {}", value.value_type()))),
        }
    }

    fn length_value(len: usize) -> Result<Value, Fault> {
        i32::try_from(len)
            .map(Value::I32)
            .map_err(|_| Fault::raise(ErrorKind::Value, "Length does not fit in i32"))
    }

    // ── faults ──

    fn new_error(&mut self, kind: ErrorKind, message: &str) -> Handle<ObjError> {
        let (line, column) = self
            .program
            .chunks
            .get(self.chunk)
            .map(|c| c.code.location(self.instr_start))
            .unwrap_or((0, 0));
        self.heap.alloc_error(kind, message, line, column)
    }

    /// Turns a fault into an error value and transfers control to the
    /// innermost handler, or ends the run.
    fn handle_fault(&mut self, fault: Fault) -> VmResult<()> {
        let error = match fault {
            Fault::Fatal(e) => return Err(e),
            Fault::Throw(Value::Error(h)) => h,
            Fault::Throw(other) => {
                let text = self.format_value(other);
                self.new_error(ErrorKind::Runtime, &text)
            }
            Fault::Raise { kind, message } => self.new_error(kind, &message),
        };
        self.stats.errors_raised += 1;
        self.last_error = Value::Error(error);

        let Some(handler) = self.handlers.pop() else {
            let obj = self.heap.get(error)?;
            let message = self.heap.string_text(obj.message)?.into_owned();
            tracing::warn!(kind = %obj.kind, %message, line = obj.line, column = obj.column, "uncaught error");
            let function = self.program.chunks.get(self.chunk).map(|c| c.name.clone()).unwrap_or_default();
            return Err(VmError::Uncaught {
                kind: obj.kind,
                message,
                line: obj.line,
                column: obj.column,
                function,
                offset: self.instr_start,
            });
        };
        while self.frames.len() > handler.frame_depth {
            if let Some(frame) = self.frames.pop() {
                self.restore_window(&frame.saved_window);
            }
        }
        self.chunk = handler.chunk;
        self.ip = handler.target;
        if let Some(reg) = handler.catch_reg {
            self.set_reg(reg as usize, Value::Error(error));
        }
        Ok(())
    }

    // ── control flow ──

    fn jump_forward(&mut self, distance: u16, code_len: usize) -> Result<(), VmError> {
        let target = self.ip + distance as usize;
        if target > code_len {
            return Err(VmError::BadJump { offset: self.instr_start });
        }
        self.ip = target;
        Ok(())
    }

    fn jump_back(&mut self, distance: u16) -> Result<(), VmError> {
        self.ip = self
            .ip
            .checked_sub(distance as usize)
            .ok_or(VmError::BadJump { offset: self.instr_start })?;
        Ok(())
    }

    fn call_value(&mut self, callee: Value, first_arg: u8, argc: u8, result_reg: u8) -> Result<(), Fault> {
        let (function, closure) = match callee {
            Value::Function(index) => (index, None),
            Value::Closure(h) => (self.heap.get(h)?.function, Some(h)),
            other => {
                return Err(Fault::raise(ErrorKind::Type, format!("Value of type {} is not callable", other.value_type())));
            }
        };
        let program = self.program;
        let target = program
            .chunks
            .get(function as usize)
            .ok_or(VmError::UndefinedFunction { index: function })?;
        if target.arity != argc {
            return Err(Fault::raise(
                ErrorKind::Argument,
                format!("{} expects {} argument(s), got {argc}", target.name, target.arity),
            ));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow { max: MAX_FRAMES }.into());
        }
        if FRAME_WINDOW_START + argc as usize > REGISTER_COUNT {
            return Err(VmError::RegisterWindow { start: FRAME_WINDOW_START, count: argc as usize }.into());
        }
        let args = self.window(first_arg, argc)?.to_vec();
        let saved_window = self.registers[FRAME_WINDOW_START..].to_vec();
        if let Some(caller) = self.frames.last_mut() {
            caller.ip = self.ip;
        }
        self.frames.push(CallFrame { chunk: function as usize, ip: 0, result_reg, closure, saved_window });

        // the callee starts with its arguments and an otherwise empty window
        for slot in &mut self.registers[FRAME_WINDOW_START..] {
            *slot = Value::Void;
        }
        for (i, arg) in args.into_iter().enumerate() {
            self.set_reg(FRAME_WINDOW_START + i, arg);
        }
        self.chunk = function as usize;
        self.ip = 0;
        self.stats.calls += 1;
        self.stats.max_frame_depth = self.stats.max_frame_depth.max(self.frames.len());
        Ok(())
    }

    /// Pops the active frame. Returns the value when the entry frame returns.
    fn return_from_frame(&mut self, value: Value) -> Option<Value> {
        let Some(frame) = self.frames.pop() else {
            return Some(value);
        };
        let depth = self.frames.len();
        self.handlers.retain(|h| h.frame_depth <= depth);
        let Some(caller) = self.frames.last() else {
            return Some(value);
        };
        self.chunk = caller.chunk;
        self.ip = caller.ip;
        self.restore_window(&frame.saved_window);
        self.set_reg(frame.result_reg as usize, value);
        None
    }

    fn active_closure(&self) -> Result<Handle<ObjClosure>, Fault> {
        self.frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| Fault::raise(ErrorKind::Runtime, "No active closure"))
    }

    // ── values ──

    fn values_equal(&self, a: Value, b: Value) -> Result<bool, Fault> {
        Ok(match (a, b) {
            (Value::String(x), Value::String(y)) => self.heap.strings_equal(x, y)?,
            (Value::Enum(x), Value::Enum(y)) => {
                if x == y {
                    return Ok(true);
                }
                let (ex, ey) = (self.heap.get(x)?, self.heap.get(y)?);
                if ex.variant_index != ey.variant_index
                    || ex.payload.len() != ey.payload.len()
                    || !self.heap.strings_equal(ex.type_name, ey.type_name)?
                {
                    return Ok(false);
                }
                for (&pa, &pb) in ex.payload.iter().zip(&ey.payload) {
                    if !self.values_equal(pa, pb)? {
                        return Ok(false);
                    }
                }
                true
            }
            _ => a == b,
        })
    }

    fn typed_constant(&self, value: Value, op: Opcode) -> Result<Value, Fault> {
        let ok = match op {
            Opcode::LoadI32Const => matches!(value, Value::I32(_)),
            Opcode::LoadI64Const => matches!(value, Value::I64(_)),
            Opcode::LoadF64Const => matches!(value, Value::F64(_)),
            _ => true,
        };
        if ok {
            Ok(value)
        } else {
            Err(Fault::raise(
                ErrorKind::Type,
                format!("{} cannot load a {} constant", op.mnemonic(), value.value_type()),
            ))
        }
    }

    fn concat(&mut self, left: Handle<ObjString>, right: Handle<ObjString>) -> Result<Value, Fault> {
        let combined = self.heap.get(left)?.len() + self.heap.get(right)?.len();
        let handle = if combined >= ROPE_THRESHOLD {
            self.heap.concat_strings(left, right)?
        } else {
            let joined = {
                let l = self.heap.string_text(left)?;
                let r = self.heap.string_text(right)?;
                format!("{l}{r}")
            };
            self.heap.alloc_string(joined)
        };
        Ok(Value::String(handle))
    }

    fn string_index(&mut self, string: Handle<ObjString>, index: usize) -> Result<Value, Fault> {
        let obj = self.heap.get(string)?;
        let len = obj.len();
        let Some(byte) = obj.rope().char_at(index) else {
            return Err(Fault::raise(ErrorKind::Index, format!("String index {index} out of range (len {len})")));
        };
        let piece = if byte.is_ascii() {
            (byte as char).to_string()
        } else {
            let text = obj.text();
            match text.get(index..).and_then(|rest| rest.chars().next()) {
                Some(c) => c.to_string(),
                None => {
                    return Err(Fault::raise(
                        ErrorKind::Value,
                        format!("String index {index} is not on a character boundary"),
                    ));
                }
            }
        };
        Ok(Value::String(self.heap.intern(&piece)))
    }

    fn substring(&mut self, string: Handle<ObjString>, start: usize, len: usize) -> Result<Value, Fault> {
        let obj = self.heap.get(string)?;
        let total = obj.len();
        let rope = StringRope::substring(obj.rope(), start, len).ok_or_else(|| {
            Fault::raise(ErrorKind::Index, format!("Substring {start}+{len} out of range (len {total})"))
        })?;
        Ok(Value::String(self.heap.alloc_rope(rope)))
    }

    fn get_iter(&mut self, value: Value) -> Result<Value, Fault> {
        Ok(match value {
            Value::RangeIterator(_) | Value::ArrayIterator(_) => value,
            Value::Array(array) => Value::ArrayIterator(self.heap.alloc(ObjArrayIterator { array, index: 0 })),
            Value::I32(_) | Value::I64(_) | Value::U32(_) | Value::U64(_) => match value.as_i64() {
                Some(end) if end >= 0 => {
                    Value::RangeIterator(self.heap.alloc(ObjRangeIterator { current: 0, end, step: 1 }))
                }
                _ => return Err(Fault::raise(ErrorKind::Value, "Cannot iterate negative integer")),
            },
            other => {
                return Err(Fault::raise(ErrorKind::Type, format!("Value of type {} is not iterable", other.value_type())));
            }
        })
    }

    fn iter_next(&mut self, iterator: Value) -> Result<Option<Value>, Fault> {
        match iterator {
            Value::RangeIterator(h) => Ok(self.heap.get_mut(h)?.next_value().map(Value::I64)),
            Value::ArrayIterator(h) => {
                let ObjArrayIterator { array, index } = *self.heap.get(h)?;
                let next = self.heap.array_get(array, index)?;
                if next.is_some() {
                    self.heap.get_mut(h)?.index = index + 1;
                }
                Ok(next)
            }
            _ => Err(Fault::raise(ErrorKind::Type, "Invalid iterator")),
        }
    }

    // ── dispatch ──

    /// Runs until the entry frame returns or a fault stops an instruction.
    fn dispatch(&mut self) -> Result<Value, Fault> {
        let program = self.program;
        loop {
            if self.gc.should_collect(&self.heap) {
                self.collect_garbage();
            }

            let chunk = program
                .chunks
                .get(self.chunk)
                .ok_or(VmError::UndefinedFunction { index: self.chunk as u16 })?;
            let code = chunk.code.code();
            if self.ip >= code.len() {
                match self.return_from_frame(Value::Void) {
                    Some(value) => return Ok(value),
                    None => continue,
                }
            }

            let start = self.ip;
            let byte = code[start];
            let op = Opcode::from_byte(byte).ok_or(VmError::UnknownOpcode { op: byte, offset: start })?;
            let len = op.length();
            if start + len > code.len() {
                return Err(VmError::TruncatedInstruction { mnemonic: op.mnemonic(), offset: start }.into());
            }
            let operands = &code[start + 1..start + len];
            self.instr_start = start;
            self.ip = start + len;
            self.stats.instructions += 1;
            if self.config.trace_execution {
                tracing::trace!(function = %chunk.name, offset = start, op = op.mnemonic(), "exec");
            }

            macro_rules! r {
                ($i:expr) => {
                    operands[$i]
                };
            }
            macro_rules! reg {
                ($i:expr) => {
                    self.registers[operands[$i] as usize]
                };
            }
            macro_rules! set {
                ($i:expr, $value:expr) => {{
                    let value = $value;
                    self.set_reg(operands[$i] as usize, value)
                }};
            }
            macro_rules! wide {
                ($i:expr) => {
                    u16::from_be_bytes([operands[$i], operands[$i + 1]])
                };
            }
            macro_rules! constant {
                ($i:expr) => {{
                    let index = wide!($i);
                    chunk.constants.get(index).ok_or(VmError::BadConstant { index })?
                }};
            }

            match op {
                // ── constants, moves and globals ──
                Opcode::LoadConst | Opcode::LoadI32Const | Opcode::LoadI64Const | Opcode::LoadF64Const => {
                    let value = self.typed_constant(constant!(1), op)?;
                    set!(0, value);
                }
                Opcode::LoadTrue => set!(0, Value::Bool(true)),
                Opcode::LoadFalse => set!(0, Value::Bool(false)),
                Opcode::Move | Opcode::MoveI32 | Opcode::MoveI64 | Opcode::MoveF64 => set!(0, reg!(1)),
                Opcode::LoadGlobal => {
                    let value = self.globals[r!(1) as usize];
                    if value.is_void() {
                        return Err(Fault::raise(ErrorKind::Name, format!("Undefined global g{}", r!(1))));
                    }
                    set!(0, value);
                }
                Opcode::StoreGlobal => self.globals[r!(0) as usize] = reg!(1),

                // ── single-register arithmetic ──
                Opcode::IncI32R | Opcode::DecI32R => {
                    let Value::I32(n) = reg!(0) else { return Err(NumKind::I32.mismatch()) };
                    let next = if op == Opcode::IncI32R { n.checked_add(1) } else { n.checked_sub(1) };
                    let next = next.ok_or_else(|| Fault::raise(ErrorKind::Value, "Integer overflow"))?;
                    set!(0, Value::I32(next));
                }
                Opcode::IncI64R | Opcode::DecI64R => {
                    let Value::I64(n) = reg!(0) else { return Err(NumKind::I64.mismatch()) };
                    let next = if op == Opcode::IncI64R { n.checked_add(1) } else { n.checked_sub(1) };
                    let next = next.ok_or_else(|| Fault::raise(ErrorKind::Value, "Integer overflow"))?;
                    set!(0, Value::I64(next));
                }
                Opcode::NegI32R => {
                    let Value::I32(n) = reg!(1) else { return Err(NumKind::I32.mismatch()) };
                    let negated = n
                        .checked_neg()
                        .ok_or_else(|| Fault::raise(ErrorKind::Value, "Integer overflow: cannot negate INT32_MIN"))?;
                    set!(0, Value::I32(negated));
                }
                Opcode::NegI64R => {
                    let Value::I64(n) = reg!(1) else { return Err(NumKind::I64.mismatch()) };
                    let negated = n
                        .checked_neg()
                        .ok_or_else(|| Fault::raise(ErrorKind::Value, "Integer overflow: cannot negate INT64_MIN"))?;
                    set!(0, Value::I64(negated));
                }
                Opcode::NegF64R => {
                    let Value::F64(n) = reg!(1) else { return Err(NumKind::F64.mismatch()) };
                    set!(0, Value::F64(-n));
                }

                // ── bitwise ──
                Opcode::AndI32R | Opcode::OrI32R | Opcode::XorI32R | Opcode::ShlI32R | Opcode::ShrI32R => {
                    let (Value::I32(a), Value::I32(b)) = (reg!(1), reg!(2)) else {
                        return Err(NumKind::I32.mismatch());
                    };
                    let shift = || {
                        u32::try_from(b)
                            .ok()
                            .filter(|&s| s < 32)
                            .ok_or_else(|| Fault::raise(ErrorKind::Value, format!("Shift amount {b} out of range")))
                    };
                    let result = match op {
                        Opcode::AndI32R => a & b,
                        Opcode::OrI32R => a | b,
                        Opcode::XorI32R => a ^ b,
                        Opcode::ShlI32R => a << shift()?,
                        _ => a >> shift()?,
                    };
                    set!(0, Value::I32(result));
                }
                Opcode::NotI32R => {
                    let Value::I32(n) = reg!(1) else { return Err(NumKind::I32.mismatch()) };
                    set!(0, Value::I32(!n));
                }

                // ── equality and logic ──
                Opcode::EqR | Opcode::NeR => {
                    let equal = self.values_equal(reg!(1), reg!(2))?;
                    set!(0, Value::Bool(equal == (op == Opcode::EqR)));
                }
                Opcode::AndBoolR | Opcode::OrBoolR => {
                    let (Value::Bool(a), Value::Bool(b)) = (reg!(1), reg!(2)) else {
                        return Err(Fault::raise(ErrorKind::Type, "Operands must be bool"));
                    };
                    set!(0, Value::Bool(if op == Opcode::AndBoolR { a && b } else { a || b }));
                }
                Opcode::NotBoolR => {
                    let Value::Bool(b) = reg!(1) else {
                        return Err(Fault::raise(ErrorKind::Type, "Operand must be bool"));
                    };
                    set!(0, Value::Bool(!b));
                }

                // ── strings ──
                Opcode::ConcatR => {
                    let (left, right) = (self.string_operand(r!(1))?, self.string_operand(r!(2))?);
                    let joined = self.concat(left, right)?;
                    set!(0, joined);
                }
                Opcode::ToStringR => {
                    let value = reg!(1);
                    let text = match value {
                        Value::String(_) => None,
                        other => Some(self.format_value(other)),
                    };
                    let result = match text {
                        None => value,
                        Some(text) => Value::String(self.heap.alloc_string(text)),
                    };
                    set!(0, result);
                }
                Opcode::StringIndexR => {
                    let string = self.string_operand(r!(1))?;
                    let index = self.index_operand(r!(2))?;
                    let piece = self.string_index(string, index)?;
                    set!(0, piece);
                }
                Opcode::StringLenR => {
                    let string = self.string_operand(r!(1))?;
                    let len = Self::length_value(self.heap.get(string)?.len())?;
                    set!(0, len);
                }
                Opcode::SubstringR => {
                    let string = self.string_operand(r!(1))?;
                    let start = self.index_operand(r!(2))?;
                    let len = self.index_operand(r!(3))?;
                    let piece = self.substring(string, start, len)?;
                    set!(0, piece);
                }

                // ── arrays ──
                Opcode::MakeArrayR => {
                    let items = self.window(r!(1), r!(2))?.to_vec();
                    let array = self.heap.alloc_array(items);
                    set!(0, Value::Array(array));
                }
                Opcode::ArrayGetR => {
                    let array = self.array_operand(r!(1))?;
                    let index = self.index_operand(r!(2))?;
                    let len = self.heap.get(array)?.len();
                    let value = self.heap.array_get(array, index)?.ok_or_else(|| {
                        Fault::raise(ErrorKind::Index, format!("Array index {index} out of bounds (len {len})"))
                    })?;
                    set!(0, value);
                }
                Opcode::ArraySetR => {
                    let array = self.array_operand(r!(0))?;
                    let index = self.index_operand(r!(1))?;
                    let len = self.heap.get(array)?.len();
                    if !self.heap.array_set(array, index, reg!(2))? {
                        return Err(Fault::raise(
                            ErrorKind::Index,
                            format!("Array index {index} out of bounds (len {len})"),
                        ));
                    }
                }
                Opcode::ArrayLenR => {
                    let array = self.array_operand(r!(1))?;
                    let len = Self::length_value(self.heap.get(array)?.len())?;
                    set!(0, len);
                }
                Opcode::ArrayPushR => {
                    let array = self.array_operand(r!(0))?;
                    self.heap.array_push(array, reg!(1))?;
                }
                Opcode::ArrayPopR => {
                    let array = self.array_operand(r!(1))?;
                    let value = self
                        .heap
                        .array_pop(array)?
                        .ok_or_else(|| Fault::raise(ErrorKind::Index, "Cannot pop from an empty array"))?;
                    set!(0, value);
                }
                Opcode::ArraySortedR => {
                    let array = self.array_operand(r!(1))?;
                    let items = builtins::sorted(&self.heap, array)?;
                    let sorted = self.heap.alloc_array(items);
                    set!(0, Value::Array(sorted));
                }
                Opcode::ArraySliceR => {
                    let array = self.array_operand(r!(1))?;
                    let (start, end) = (self.index_operand(r!(2))?, self.index_operand(r!(3))?);
                    let items = self.heap.get(array)?.items();
                    let slice = items.get(start..end).ok_or_else(|| {
                        Fault::raise(ErrorKind::Index, format!("Slice {start}..{end} out of bounds (len {})", items.len()))
                    })?;
                    let slice = slice.to_vec();
                    let sliced = self.heap.alloc_array(slice);
                    set!(0, Value::Array(sliced));
                }

                // ── enums ──
                Opcode::EnumNewR => {
                    let payload = self.window(r!(3), r!(2))?.to_vec();
                    let (Value::String(type_name), Value::String(variant_name)) = (constant!(4), constant!(6)) else {
                        return Err(Fault::raise(ErrorKind::Type, "Enum names must be string constants"));
                    };
                    let value = self.heap.alloc(ObjEnum { type_name, variant_name, variant_index: r!(1), payload });
                    set!(0, Value::Enum(value));
                }
                Opcode::EnumTagEqR => {
                    let matches = self.enum_operand(r!(1))?.variant_index == r!(2);
                    set!(0, Value::Bool(matches));
                }
                Opcode::EnumPayloadR => {
                    let value = self.enum_operand(r!(1))?;
                    if value.variant_index != r!(2) {
                        return Err(Fault::raise(
                            ErrorKind::Value,
                            format!("Enum holds variant {}, not {}", value.variant_index, r!(2)),
                        ));
                    }
                    let field = value.payload.get(r!(3) as usize).copied().ok_or_else(|| {
                        Fault::raise(ErrorKind::Index, format!("Enum payload has no field {}", r!(3)))
                    })?;
                    set!(0, field);
                }

                // ── iterators ──
                Opcode::GetIterR => {
                    let iterator = self.get_iter(reg!(1))?;
                    set!(0, iterator);
                }
                Opcode::IterNextR => match self.iter_next(reg!(1))? {
                    Some(value) => {
                        set!(0, value);
                        set!(2, Value::Bool(true));
                    }
                    None => set!(2, Value::Bool(false)),
                },

                // ── errors ──
                Opcode::TryBegin => {
                    if self.handlers.len() >= MAX_TRY_DEPTH {
                        return Err(VmError::TryOverflow { max: MAX_TRY_DEPTH }.into());
                    }
                    let target = self.ip + wide!(1) as usize;
                    if target > code.len() {
                        return Err(VmError::BadJump { offset: start }.into());
                    }
                    self.handlers.push(TryHandler {
                        frame_depth: self.frames.len(),
                        catch_reg: (r!(0) != NO_CATCH_REGISTER).then_some(r!(0)),
                        chunk: self.chunk,
                        target,
                    });
                }
                Opcode::TryEnd => {
                    self.handlers.pop().ok_or(VmError::UnbalancedTry)?;
                }
                Opcode::Throw => return Err(Fault::Throw(reg!(0))),

                // ── control flow ──
                Opcode::Jump => self.jump_forward(wide!(0), code.len())?,
                Opcode::JumpShort => self.jump_forward(r!(0) as u16, code.len())?,
                Opcode::JumpIfR => {
                    if self.condition(r!(0))? {
                        self.jump_forward(wide!(1), code.len())?;
                    }
                }
                Opcode::JumpIfNotR => {
                    if !self.condition(r!(0))? {
                        self.jump_forward(wide!(1), code.len())?;
                    }
                }
                Opcode::JumpIfNotShort => {
                    if !self.condition(r!(0))? {
                        self.jump_forward(r!(1) as u16, code.len())?;
                    }
                }
                Opcode::JumpIfNotI32Typed => {
                    let a = self.typed_read(r!(0), NumKind::I32)?;
                    let b = self.typed_read(r!(1), NumKind::I32)?;
                    if !arith::compare(NumKind::I32, arith::CmpOp::Lt, a, b)? {
                        self.jump_forward(wide!(2), code.len())?;
                    }
                }
                Opcode::BranchTyped => {
                    // the loop id only tags the branch for tooling
                    if !self.condition(r!(2))? {
                        self.jump_forward(wide!(3), code.len())?;
                    }
                }
                Opcode::Loop => self.jump_back(wide!(0))?,
                Opcode::JumpBackShort | Opcode::LoopShort => self.jump_back(r!(0) as u16)?,

                // ── calls ──
                Opcode::CallR => self.call_value(reg!(0), r!(1), r!(2), r!(3))?,
                Opcode::ReturnR | Opcode::ReturnVoid => {
                    let value = if op == Opcode::ReturnR { reg!(0) } else { Value::Void };
                    if let Some(result) = self.return_from_frame(value) {
                        return Ok(result);
                    }
                }
                Opcode::ClosureR => {
                    let Value::Function(function) = reg!(1) else {
                        return Err(Fault::raise(ErrorKind::Type, "CLOSURE_R needs a function value"));
                    };
                    let upvalues = self.window(r!(2), r!(3))?.to_vec();
                    let closure = self.heap.alloc(ObjClosure { function, upvalues });
                    set!(0, Value::Closure(closure));
                }
                Opcode::GetUpvalueR => {
                    let closure = self.active_closure()?;
                    let value = self.heap.get(closure)?.upvalues.get(r!(1) as usize).copied();
                    let value = value.ok_or_else(|| Fault::raise(ErrorKind::Index, format!("No upvalue {}", r!(1))))?;
                    set!(0, value);
                }
                Opcode::SetUpvalueR => {
                    let closure = self.active_closure()?;
                    let value = reg!(1);
                    let slot = self.heap.get_mut(closure)?.upvalues.get_mut(r!(0) as usize);
                    match slot {
                        Some(slot) => *slot = value,
                        None => return Err(Fault::raise(ErrorKind::Index, format!("No upvalue {}", r!(0)))),
                    }
                }

                // ── builtins ──
                Opcode::PrintR | Opcode::PrintNoNlR => {
                    let fmt = ValueFormatter::new(&self.heap, &self.function_names);
                    builtins::print(self.io.out.as_mut(), &fmt, &[reg!(0)], op == Opcode::PrintR)?;
                }
                Opcode::PrintMultiR => {
                    let values = self.window(r!(0), r!(1))?.to_vec();
                    let fmt = ValueFormatter::new(&self.heap, &self.function_names);
                    builtins::print(self.io.out.as_mut(), &fmt, &values, r!(2) != 0)?;
                }
                Opcode::InputR => {
                    let prompt = match (r!(1), reg!(2)) {
                        (0, _) => None,
                        (_, Value::String(h)) => Some(self.heap.string_text(h)?.into_owned()),
                        (_, other) => Some(self.format_value(other)),
                    };
                    let line = builtins::input(
                        self.io.input.as_mut(),
                        self.io.out.as_mut(),
                        self.io.err.as_mut(),
                        prompt.as_deref(),
                        self.io.interactive,
                    )?;
                    let text = self.heap.alloc_string(line);
                    set!(0, Value::String(text));
                }
                Opcode::RangeR => {
                    let range = builtins::range(self.window(r!(2), r!(1))?)?;
                    let iterator = self.heap.alloc(range);
                    set!(0, Value::RangeIterator(iterator));
                }
                Opcode::ParseIntR => {
                    let n = builtins::parse_int(&self.heap, reg!(1))?;
                    set!(0, Value::I32(n));
                }
                Opcode::ParseFloatR => {
                    let n = builtins::parse_float(&self.heap, reg!(1))?;
                    set!(0, Value::F64(n));
                }
                Opcode::TypeOfR => {
                    let label = builtins::type_of(&self.heap, reg!(1)).into_owned();
                    let label = self.heap.intern(&label);
                    set!(0, Value::String(label));
                }
                Opcode::IsTypeR => {
                    let label = self.string_operand(r!(2))?;
                    let label = self.heap.string_text(label)?.into_owned();
                    let matches = builtins::is_type(&self.heap, reg!(1), &label);
                    set!(0, Value::Bool(matches));
                }

                // ── runtime services ──
                Opcode::TimeStamp => {
                    let nanos = i64::try_from(self.started.elapsed().as_nanos()).unwrap_or(i64::MAX);
                    set!(0, Value::I64(nanos));
                }
                Opcode::GcPause => self.gc.pause(),
                Opcode::GcResume => self.gc.resume(),
                Opcode::Halt => return Ok(Value::Void),

                // numeric families: arithmetic, comparisons, conversions
                _ => self.numeric(op, operands)?,
            }
        }
    }

    fn numeric(&mut self, op: Opcode, operands: &[u8]) -> Result<(), Fault> {
        if let Some((kind, arith_op)) = arith::arith_family(op) {
            let (a, b) = (self.registers[operands[1] as usize], self.registers[operands[2] as usize]);
            let value = arith::binary(kind, arith_op, a, b)?;
            self.set_reg(operands[0] as usize, value);
            return Ok(());
        }
        if let Some((kind, arith_op)) = arith::typed_arith_family(op) {
            let a = self.typed_read(operands[1], kind)?;
            let b = self.typed_read(operands[2], kind)?;
            let value = arith::binary(kind, arith_op, a, b)?;
            self.typed_write(operands[0], value)?;
            return Ok(());
        }
        if let Some((kind, cmp)) = arith::compare_family(op) {
            let typed = matches!(op, Opcode::LtI32Typed | Opcode::LeI32Typed | Opcode::GtI32Typed | Opcode::GeI32Typed);
            if typed {
                let a = self.typed_read(operands[1], kind)?;
                let b = self.typed_read(operands[2], kind)?;
                let result = arith::compare(kind, cmp, a, b)?;
                self.typed_write(operands[0], Value::Bool(result))?;
            } else {
                let (a, b) = (self.registers[operands[1] as usize], self.registers[operands[2] as usize]);
                let result = arith::compare(kind, cmp, a, b)?;
                self.set_reg(operands[0] as usize, Value::Bool(result));
            }
            return Ok(());
        }
        let value = arith::convert(op, self.registers[operands[1] as usize])?;
        self.set_reg(operands[0] as usize, value);
        Ok(())
    }
}
