use std::fmt::Write as _;

use super::opcode::{Opcode, Operand};
use super::{BytecodeBuffer, Chunk, CompiledProgram};
use crate::builtins::ValueFormatter;
use crate::heap::ObjectHeap;
use crate::value::Value;

/// Human-readable listing of every chunk in `program`.
pub fn disassemble_program(program: &CompiledProgram, heap: &ObjectHeap) -> String {
    let names: Vec<String> = program.chunks.iter().map(|c| c.name.clone()).collect();
    let fmt = ValueFormatter::new(heap, &names);
    let mut out = String::new();
    for chunk in &program.chunks {
        write_chunk(&mut out, chunk, &fmt);
    }
    out
}

/// Listing of one chunk; function constants are shown by index.
pub fn disassemble(chunk: &Chunk, heap: &ObjectHeap) -> String {
    let fmt = ValueFormatter::new(heap, &[]);
    let mut out = String::new();
    write_chunk(&mut out, chunk, &fmt);
    out
}

/// The instruction at `offset` in listing form, e.g. `DIV_I32_R R3, R1, R2`.
/// `None` when `offset` does not start a complete instruction.
pub fn disassemble_instruction(program: &CompiledProgram, function: &str, offset: usize, heap: &ObjectHeap) -> Option<String> {
    let chunk = program.chunks.iter().find(|c| c.name == function)?;
    let names: Vec<String> = program.chunks.iter().map(|c| c.name.clone()).collect();
    let fmt = ValueFormatter::new(heap, &names);
    let code = &chunk.code;
    let (_, byte, len) = code.instructions().find(|&(at, _, _)| at == offset)?;
    let op = Opcode::from_byte(byte)?;
    if offset + len > code.len() {
        return None;
    }
    Some(instruction_text(op, &decode_operands(chunk, code, offset, op, &fmt)))
}

fn instruction_text(op: Opcode, operands: &[String]) -> String {
    if operands.is_empty() {
        op.mnemonic().to_string()
    } else {
        format!("{} {}", op.mnemonic(), operands.join(", "))
    }
}

fn write_chunk(out: &mut String, chunk: &Chunk, fmt: &ValueFormatter<'_>) {
    let _ = writeln!(out, "== {} (arity {}) ==", chunk.name, chunk.arity);
    let code = &chunk.code;
    let mut previous_line = None;
    for (offset, byte, len) in code.instructions() {
        let (line, _) = code.location(offset);
        let _ = write!(out, "{offset:04} ");
        if previous_line == Some(line) {
            out.push_str("   | ");
        } else {
            let _ = write!(out, "{line:4} ");
        }
        previous_line = Some(line);

        let Some(op) = Opcode::from_byte(byte) else {
            let _ = writeln!(out, "UNKNOWN 0x{byte:02X}");
            continue;
        };
        if offset + len > code.len() {
            let _ = writeln!(out, "{} <truncated>", op.mnemonic());
            break;
        }
        let operands = decode_operands(chunk, code, offset, op, fmt);
        if operands.is_empty() {
            let _ = writeln!(out, "{}", op.mnemonic());
        } else {
            let _ = writeln!(out, "{:<22} {}", op.mnemonic(), operands.join(", "));
        }
    }
}

fn decode_operands(chunk: &Chunk, code: &BytecodeBuffer, offset: usize, op: Opcode, fmt: &ValueFormatter<'_>) -> Vec<String> {
    let bytes = code.code();
    let mut cursor = offset + 1;
    let mut shown = Vec::with_capacity(op.operands().len());
    for &kind in op.operands() {
        let raw = match kind.size() {
            1 => bytes[cursor] as usize,
            _ => code.read_u16(cursor).unwrap_or(0) as usize,
        };
        cursor += kind.size() as usize;
        shown.push(match kind {
            Operand::Reg => {
                // TRY_BEGIN uses 0xFF for "no catch register"
                if op == Opcode::TryBegin && raw == 0xFF { "_".to_string() } else { format!("R{raw}") }
            }
            Operand::Imm => format!("#{raw}"),
            Operand::Global => format!("g{raw}"),
            Operand::LoopId => format!("loop {raw}"),
            Operand::Const => match chunk.constants.get(raw as u16) {
                Some(value) => format!("k{raw} ({})", render_constant(value, fmt)),
                None => format!("k{raw} (?)"),
            },
            Operand::JumpFwd | Operand::JumpFwdShort => format!("-> {:04}", cursor + raw),
            Operand::JumpBack | Operand::JumpBackShort => format!("-> {:04}", cursor.saturating_sub(raw)),
        });
    }
    shown
}

fn render_constant(value: Value, fmt: &ValueFormatter<'_>) -> String {
    match value {
        Value::String(_) => format!("{:?}", fmt.format(value)),
        Value::Function(index) => format!("@{index}"),
        other => fmt.format(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_instructions_with_lines() {
        let mut heap = ObjectHeap::new();
        let mut chunk = Chunk::new("main", 0);
        let k = chunk.add_const(Value::I32(5)).unwrap();
        let s = heap.intern("hi");
        let ks = chunk.add_const(Value::String(s)).unwrap();
        chunk.code.emit(Opcode::LoadI32Const, &[192, k as u32], 1, 1).unwrap();
        chunk.code.emit(Opcode::MoveI32, &[64, 192], 1, 5).unwrap();
        chunk.code.emit(Opcode::LoadConst, &[1, ks as u32], 2, 1).unwrap();
        chunk.code.emit(Opcode::Halt, &[], 3, 1).unwrap();

        let text = disassemble(&chunk, &heap);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "== main (arity 0) ==");
        assert!(lines[1].starts_with("0000    1 LOAD_I32_CONST"));
        assert!(lines[1].ends_with("R192, k0 (5)"));
        assert!(lines[2].starts_with("0004    | MOVE_I32"));
        assert!(lines[3].ends_with("R1, k1 (\"hi\")"));
        assert_eq!(lines[4], "0011    3 HALT");
    }

    #[test]
    fn jumps_show_targets() {
        let heap = ObjectHeap::new();
        let mut chunk = Chunk::new("loop", 0);
        let top = chunk.code.new_label("top");
        chunk.code.define_label(top).unwrap();
        chunk.code.emit(Opcode::IncI32R, &[0], 1, 1).unwrap();
        chunk.code.emit_jump(Opcode::Loop, &[], top, 1, 1).unwrap();
        chunk.code.resolve_jumps().unwrap();
        let text = disassemble(&chunk, &heap);
        assert!(text.contains("LOOP"));
        assert!(text.contains("-> 0000"));
    }

    #[test]
    fn unknown_bytes_advance_by_one() {
        let heap = ObjectHeap::new();
        let mut chunk = Chunk::new("junk", 0);
        chunk.code.append_byte(0xEE, 1, 1);
        chunk.code.append_byte(Opcode::Halt as u8, 1, 2);
        let text = disassemble(&chunk, &heap);
        assert!(text.contains("UNKNOWN 0xEE"));
        assert!(text.contains("0001    | HALT"));
    }

    #[test]
    fn single_instruction_by_function_and_offset() {
        let mut heap = ObjectHeap::new();
        let mut program = crate::asm::assemble(
            ".func main 0\n  LOAD_I32_CONST R1, 7\n  DIV_I32_R R3, R1, R2\n  RETURN_VOID\n.end\n",
            &mut heap,
        )
        .unwrap();
        program.resolve_jumps().unwrap();
        assert_eq!(disassemble_instruction(&program, "main", 0, &heap).as_deref(), Some("LOAD_I32_CONST R1, k0 (7)"));
        assert_eq!(disassemble_instruction(&program, "main", 4, &heap).as_deref(), Some("DIV_I32_R R3, R1, R2"));
        assert_eq!(disassemble_instruction(&program, "main", 5, &heap), None);
        assert_eq!(disassemble_instruction(&program, "other", 0, &heap), None);
    }
}
