use super::opcode::{Opcode, Operand};
use super::{Instructions, instruction_length, operand_size, prefix_size};
use crate::value::Value;

pub const MAX_CONSTANTS: usize = u16::MAX as usize + 1;
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BytecodeError {
    #[error("constant pool is full ({max} entries)")]
    ConstantPoolFull { max: usize },
    #[error("label '{name}' is used but never defined")]
    UndefinedLabel { name: String },
    #[error("label '{name}' is defined twice")]
    DuplicateLabel { name: String },
    #[error("jump at {from} cannot reach {to} with a {width}-byte operand")]
    JumpOutOfRange { from: usize, to: usize, width: usize },
    #[error("{op} expects {expected} operand(s), got {got}")]
    OperandCount { op: &'static str, expected: usize, got: usize },
    #[error("operand value {value} does not fit in {width} byte(s)")]
    OperandTooWide { value: u32, width: u8 },
    #[error("{op} has no jump operand")]
    NotAJump { op: &'static str },
    #[error("no operand byte {field} in instruction at {offset}")]
    BadOperandField { offset: usize, field: usize },
    #[error("label #{index} does not belong to this buffer")]
    UnknownLabel { index: u32 },
    #[error("cannot delete {length} byte(s) at {start} from a {len}-byte buffer")]
    DeleteOutOfRange { start: usize, length: usize, len: usize },
}

pub type BytecodeResult<T> = Result<T, BytecodeError>;

/// Symbolic jump target inside one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A jump whose offset operand is filled in by `resolve_jumps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpPatch {
    /// Offset of the jump instruction's opcode byte.
    pub instr_offset: usize,
    pub label: Label,
}

// ── Bytecode buffer ──────────────────────────────────────────────────

/// Encoded instruction stream with a source location for every byte.
#[derive(Debug, Clone, Default)]
pub struct BytecodeBuffer {
    code: Vec<u8>,
    lines: Vec<u32>,
    columns: Vec<u32>,
    patches: Vec<JumpPatch>,
    labels: Vec<Option<usize>>,
    label_names: Vec<String>,
    jumps_resolved: bool,
}

impl BytecodeBuffer {
    pub fn new() -> Self {
        BytecodeBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.code.capacity()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn lines(&self) -> &[u32] {
        &self.lines
    }

    pub fn columns(&self) -> &[u32] {
        &self.columns
    }

    /// Source (line, column) recorded for the byte at `offset`.
    pub fn location(&self, offset: usize) -> (u32, u32) {
        match (self.lines.get(offset), self.columns.get(offset)) {
            (Some(&l), Some(&c)) => (l, c),
            _ => (0, 0),
        }
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions::new(&self.code)
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let hi = *self.code.get(offset)?;
        let lo = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Writes one byte plus its location, doubling capacity before it would overflow.
    pub fn append_byte(&mut self, value: u8, line: u32, column: u32) {
        if self.code.len() == self.code.capacity() {
            let target = (self.code.capacity() * 2).max(MIN_CAPACITY);
            let extra = target - self.code.len();
            self.code.reserve_exact(extra);
            self.lines.reserve_exact(extra);
            self.columns.reserve_exact(extra);
        }
        self.code.push(value);
        self.lines.push(line);
        self.columns.push(column);
    }

    pub fn emit_u16(&mut self, value: u16, line: u32, column: u32) {
        let [hi, lo] = value.to_be_bytes();
        self.append_byte(hi, line, column);
        self.append_byte(lo, line, column);
    }

    /// Encodes `op` with every operand in layout order, jump distances
    /// included as raw values. Returns the instruction's offset.
    pub fn emit(&mut self, op: Opcode, operands: &[u32], line: u32, column: u32) -> BytecodeResult<usize> {
        let layout = op.operands();
        if layout.len() != operands.len() {
            return Err(BytecodeError::OperandCount {
                op: op.mnemonic(),
                expected: layout.len(),
                got: operands.len(),
            });
        }
        let offset = self.code.len();
        self.append_byte(op as u8, line, column);
        for (&kind, &value) in layout.iter().zip(operands) {
            self.emit_operand(kind, value, line, column)?;
        }
        Ok(offset)
    }

    /// Emits a jump to `label`; the offset is written by `resolve_jumps`.
    pub fn emit_jump(&mut self, op: Opcode, operands: &[u32], label: Label, line: u32, column: u32) -> BytecodeResult<usize> {
        if op.jump_operand().is_none() {
            return Err(BytecodeError::NotAJump { op: op.mnemonic() });
        }
        self.label_name(label)?;
        let offset = self.emit_with_jump(op, operands, 0, line, column)?;
        self.patches.push(JumpPatch { instr_offset: offset, label });
        Ok(offset)
    }

    fn emit_with_jump(&mut self, op: Opcode, operands: &[u32], distance: u32, line: u32, column: u32) -> BytecodeResult<usize> {
        let layout = op.operands();
        let expected = layout.len() - 1;
        if operands.len() != expected {
            return Err(BytecodeError::OperandCount { op: op.mnemonic(), expected, got: operands.len() });
        }
        let offset = self.code.len();
        self.append_byte(op as u8, line, column);
        let mut values = operands.iter();
        for &kind in layout {
            let value = if kind.is_jump() { distance } else { values.next().copied().unwrap_or(0) };
            self.emit_operand(kind, value, line, column)?;
        }
        Ok(offset)
    }

    fn emit_operand(&mut self, kind: Operand, value: u32, line: u32, column: u32) -> BytecodeResult<()> {
        let width = kind.size();
        if width == 1 {
            let byte = u8::try_from(value).map_err(|_| BytecodeError::OperandTooWide { value, width })?;
            self.append_byte(byte, line, column);
        } else {
            let word = u16::try_from(value).map_err(|_| BytecodeError::OperandTooWide { value, width })?;
            self.emit_u16(word, line, column);
        }
        Ok(())
    }

    // ── labels and jump resolution ──

    pub fn new_label(&mut self, name: impl Into<String>) -> Label {
        self.labels.push(None);
        self.label_names.push(name.into());
        Label((self.labels.len() - 1) as u32)
    }

    /// Binds `label` to the current end of the buffer.
    pub fn define_label(&mut self, label: Label) -> BytecodeResult<()> {
        let here = self.code.len();
        let index = label.0 as usize;
        match self.labels.get(index) {
            None => Err(BytecodeError::UnknownLabel { index: label.0 }),
            Some(Some(_)) => Err(BytecodeError::DuplicateLabel { name: self.label_name(label)?.to_string() }),
            Some(None) => {
                self.labels[index] = Some(here);
                Ok(())
            }
        }
    }

    fn label_name(&self, label: Label) -> BytecodeResult<&str> {
        self.label_names
            .get(label.0 as usize)
            .map(String::as_str)
            .ok_or(BytecodeError::UnknownLabel { index: label.0 })
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// True when some defined label points at `offset`.
    pub fn is_label_target(&self, offset: usize) -> bool {
        self.labels.iter().any(|l| *l == Some(offset))
    }

    pub fn pending_patches(&self) -> &[JumpPatch] {
        &self.patches
    }

    pub fn jumps_resolved(&self) -> bool {
        self.jumps_resolved
    }

    /// Writes every pending jump distance. Forward forms store
    /// `target - (operand_offset + operand_size)`; backward forms store the
    /// distance back from the same point.
    pub fn resolve_jumps(&mut self) -> BytecodeResult<()> {
        for patch in std::mem::take(&mut self.patches) {
            let op = self.code[patch.instr_offset];
            let operand_offset = patch.instr_offset + prefix_size(op);
            let width = operand_size(op);
            let next = operand_offset + width;
            let name = self.label_name(patch.label)?;
            let target = self
                .label_offset(patch.label)
                .ok_or_else(|| BytecodeError::UndefinedLabel { name: name.to_string() })?;
            let backward = Opcode::from_byte(op)
                .and_then(Opcode::jump_operand)
                .is_some_and(Operand::is_backward);
            let distance = if backward { next.checked_sub(target) } else { target.checked_sub(next) };
            let out_of_range = BytecodeError::JumpOutOfRange { from: patch.instr_offset, to: target, width };
            let distance = distance.ok_or(out_of_range.clone())?;
            if width == 1 {
                let byte = u8::try_from(distance).map_err(|_| out_of_range.clone())?;
                self.code[operand_offset] = byte;
            } else {
                let word = u16::try_from(distance).map_err(|_| out_of_range)?;
                let [hi, lo] = word.to_be_bytes();
                self.code[operand_offset] = hi;
                self.code[operand_offset + 1] = lo;
            }
        }
        self.jumps_resolved = true;
        Ok(())
    }

    // ── in-place surgery ──

    /// Removes `length` bytes at `start`, shifting code and locations left
    /// together. Pending jumps and labels after the hole move with the code.
    pub fn delete_range(&mut self, start: usize, length: usize) -> BytecodeResult<()> {
        let len = self.code.len();
        let end = start
            .checked_add(length)
            .filter(|&end| end <= len)
            .ok_or(BytecodeError::DeleteOutOfRange { start, length, len })?;
        if length == 0 {
            return Ok(());
        }
        let removed = end - start;
        self.code.drain(start..end);
        self.lines.drain(start..end);
        self.columns.drain(start..end);

        self.patches.retain(|p| p.instr_offset < start || p.instr_offset >= end);
        for patch in &mut self.patches {
            if patch.instr_offset >= end {
                patch.instr_offset -= removed;
            }
        }
        for slot in self.labels.iter_mut().flatten() {
            if *slot >= end {
                *slot -= removed;
            } else if *slot > start {
                *slot = start;
            }
        }
        Ok(())
    }

    /// Overwrites operand byte `field` (1 = first byte after the opcode) of the
    /// instruction at `offset`. The instruction length never changes.
    pub fn patch_operand(&mut self, offset: usize, field: usize, value: u8) -> BytecodeResult<()> {
        let len = instruction_length(&self.code, offset);
        if field == 0 || field >= len {
            return Err(BytecodeError::BadOperandField { offset, field });
        }
        self.code[offset + field] = value;
        Ok(())
    }
}

// ── Constant pool ────────────────────────────────────────────────────

/// Append-only literal table; indices are stable for the pool's lifetime.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    values: Vec<Value>,
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool::default()
    }

    pub fn add_constant(&mut self, value: Value) -> BytecodeResult<u16> {
        if self.values.len() >= MAX_CONSTANTS {
            return Err(BytecodeError::ConstantPoolFull { max: MAX_CONSTANTS });
        }
        self.values.push(value);
        Ok((self.values.len() - 1) as u16)
    }

    pub fn get(&self, index: u16) -> Option<Value> {
        self.values.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

// ── Chunk ────────────────────────────────────────────────────────────

/// One function body: code, its literals and its signature.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub arity: u8,
    pub code: BytecodeBuffer,
    pub constants: ConstantPool,
}

impl Chunk {
    pub fn new(name: impl Into<String>, arity: u8) -> Self {
        Chunk { name: name.into(), arity, code: BytecodeBuffer::new(), constants: ConstantPool::new() }
    }

    pub fn add_const(&mut self, value: Value) -> BytecodeResult<u16> {
        self.constants.add_constant(value)
    }
}

// ── Compiled program ─────────────────────────────────────────────────

/// Function table; chunk 0 is the entry point.
#[derive(Debug, Clone, Default)]
pub struct CompiledProgram {
    pub chunks: Vec<Chunk>,
}

impl CompiledProgram {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        CompiledProgram { chunks }
    }

    pub fn func_index(&self, name: &str) -> Option<u16> {
        self.chunks.iter().position(|c| c.name == name).map(|i| i as u16)
    }

    pub fn resolve_jumps(&mut self) -> BytecodeResult<()> {
        for chunk in &mut self.chunks {
            chunk.code.resolve_jumps()?;
        }
        Ok(())
    }

    /// Every constant in every chunk; these are collector roots while the
    /// program runs.
    pub fn constant_roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.chunks.iter().flat_map(|c| c.constants.values().iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_with(ops: &[(Opcode, &[u32])]) -> BytecodeBuffer {
        let mut buf = BytecodeBuffer::new();
        for (i, (op, operands)) in ops.iter().enumerate() {
            buf.emit(*op, operands, i as u32 + 1, 1).unwrap();
        }
        buf
    }

    #[test]
    fn locations_track_every_byte() {
        let buf = buf_with(&[(Opcode::LoadI32Const, &[3, 0]), (Opcode::Halt, &[])]);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.lines().len(), buf.len());
        assert_eq!(buf.columns().len(), buf.len());
        assert_eq!(buf.location(0), (1, 1));
        assert_eq!(buf.location(3), (1, 1));
        assert_eq!(buf.location(4), (2, 1));
        assert!(buf.len() <= buf.capacity());
    }

    #[test]
    fn constant_index_is_big_endian() {
        let buf = buf_with(&[(Opcode::LoadConst, &[1, 0x1234])]);
        assert_eq!(buf.code(), &[Opcode::LoadConst as u8, 1, 0x12, 0x34]);
        assert_eq!(buf.read_u16(2), Some(0x1234));
    }

    #[test]
    fn capacity_grows_geometrically() {
        let mut buf = BytecodeBuffer::new();
        buf.append_byte(0, 1, 1);
        assert_eq!(buf.capacity(), 8);
        for _ in 0..8 {
            buf.append_byte(0, 1, 1);
        }
        assert!(buf.capacity() >= 16);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn operand_count_is_checked() {
        let mut buf = BytecodeBuffer::new();
        let err = buf.emit(Opcode::AddI32R, &[1, 2], 1, 1).unwrap_err();
        assert_eq!(err, BytecodeError::OperandCount { op: "ADD_I32_R", expected: 3, got: 2 });
        let err = buf.emit(Opcode::Move, &[300, 1], 1, 1).unwrap_err();
        assert_eq!(err, BytecodeError::OperandTooWide { value: 300, width: 1 });
    }

    #[test]
    fn constant_indices_are_stable() {
        let mut pool = ConstantPool::new();
        let a = pool.add_constant(Value::I32(1)).unwrap();
        let b = pool.add_constant(Value::I32(1)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(pool.get(a), Some(Value::I32(1)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn constant_pool_overflow() {
        let mut pool = ConstantPool::new();
        for i in 0..MAX_CONSTANTS {
            pool.add_constant(Value::I64(i as i64)).unwrap();
        }
        assert_eq!(pool.add_constant(Value::Void), Err(BytecodeError::ConstantPoolFull { max: MAX_CONSTANTS }));
    }

    #[test]
    fn forward_jump_resolution() {
        let mut buf = BytecodeBuffer::new();
        let end = buf.new_label("end");
        buf.emit_jump(Opcode::JumpIfNotR, &[0], end, 1, 1).unwrap();
        buf.emit(Opcode::IncI32R, &[0], 2, 1).unwrap();
        buf.define_label(end).unwrap();
        buf.emit(Opcode::Halt, &[], 3, 1).unwrap();
        buf.resolve_jumps().unwrap();
        // target 6, operand ends at 4
        assert_eq!(buf.read_u16(2), Some(2));
        assert!(buf.jumps_resolved());
        assert!(buf.pending_patches().is_empty());
    }

    #[test]
    fn backward_short_jump_resolution() {
        let mut buf = BytecodeBuffer::new();
        let top = buf.new_label("top");
        buf.define_label(top).unwrap();
        buf.emit(Opcode::IncI32R, &[0], 1, 1).unwrap();
        buf.emit_jump(Opcode::LoopShort, &[], top, 2, 1).unwrap();
        buf.resolve_jumps().unwrap();
        // operand ends at 4, target 0
        assert_eq!(buf.code()[3], 4);
    }

    #[test]
    fn short_jump_out_of_range() {
        let mut buf = BytecodeBuffer::new();
        let far = buf.new_label("far");
        buf.emit_jump(Opcode::JumpShort, &[], far, 1, 1).unwrap();
        for _ in 0..300 {
            buf.emit(Opcode::Halt, &[], 1, 1).unwrap();
        }
        buf.define_label(far).unwrap();
        assert!(matches!(buf.resolve_jumps(), Err(BytecodeError::JumpOutOfRange { width: 1, .. })));
    }

    #[test]
    fn undefined_label() {
        let mut buf = BytecodeBuffer::new();
        let nowhere = buf.new_label("nowhere");
        buf.emit_jump(Opcode::Jump, &[], nowhere, 1, 1).unwrap();
        assert_eq!(buf.resolve_jumps(), Err(BytecodeError::UndefinedLabel { name: "nowhere".into() }));
    }

    #[test]
    fn delete_range_shifts_locations_and_relocates() {
        let mut buf = BytecodeBuffer::new();
        let end = buf.new_label("end");
        buf.emit(Opcode::MoveI32, &[1, 1], 1, 1).unwrap();
        buf.emit_jump(Opcode::Jump, &[], end, 2, 5).unwrap();
        buf.emit(Opcode::MoveI32, &[2, 2], 3, 1).unwrap();
        buf.define_label(end).unwrap();
        buf.emit(Opcode::Halt, &[], 4, 1).unwrap();

        buf.delete_range(0, 3).unwrap();
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.lines().len(), 7);
        assert_eq!(buf.location(0), (2, 5));
        assert_eq!(buf.pending_patches()[0].instr_offset, 0);
        assert_eq!(buf.label_offset(end), Some(6));

        buf.resolve_jumps().unwrap();
        assert_eq!(buf.read_u16(1), Some(3));
    }

    #[test]
    fn patch_operand_keeps_length() {
        let mut buf = buf_with(&[(Opcode::LoadI32Const, &[192, 0])]);
        buf.patch_operand(0, 1, 64).unwrap();
        assert_eq!(buf.code(), &[Opcode::LoadI32Const as u8, 64, 0, 0]);
        assert!(buf.patch_operand(0, 4, 1).is_err());
        assert!(buf.patch_operand(0, 0, 1).is_err());
    }

    #[test]
    fn emit_jump_rejects_non_jumps() {
        let mut buf = BytecodeBuffer::new();
        let l = buf.new_label("l");
        assert_eq!(
            buf.emit_jump(Opcode::Move, &[0, 1], l, 1, 1),
            Err(BytecodeError::NotAJump { op: "MOVE" })
        );
    }

    #[test]
    fn labels_from_another_buffer_are_rejected() {
        let mut other = BytecodeBuffer::new();
        other.new_label("a");
        let foreign = other.new_label("b");

        let mut buf = BytecodeBuffer::new();
        assert_eq!(buf.define_label(foreign), Err(BytecodeError::UnknownLabel { index: 1 }));
        assert_eq!(
            buf.emit_jump(Opcode::Jump, &[], foreign, 1, 1),
            Err(BytecodeError::UnknownLabel { index: 1 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn delete_range_rejects_bad_bounds() {
        let mut buf = buf_with(&[(Opcode::MoveI32, &[1, 2])]);
        assert_eq!(
            buf.delete_range(2, usize::MAX),
            Err(BytecodeError::DeleteOutOfRange { start: 2, length: usize::MAX, len: 3 })
        );
        assert_eq!(
            buf.delete_range(1, 5),
            Err(BytecodeError::DeleteOutOfRange { start: 1, length: 5, len: 3 })
        );
        assert_eq!(buf.delete_range(3, 0), Ok(()));
        assert_eq!(buf.len(), 3);
    }
}
