pub mod buffer;
pub mod disasm;
pub mod opcode;

pub use buffer::{
    BytecodeBuffer, BytecodeError, Chunk, CompiledProgram, ConstantPool, JumpPatch, Label,
};
pub use opcode::{OPCODE_TABLE, OpInfo, Opcode, Operand};

// ── Codec ────────────────────────────────────────────────────────────
//
// All three functions read the static table; none of them keep state.

/// Bytes preceding the jump-offset operand of `opcode`.
#[inline]
pub fn prefix_size(opcode: u8) -> usize {
    OPCODE_TABLE[opcode as usize].prefix as usize
}

/// Width of the jump-offset operand: 1 for short forms, 2 otherwise.
#[inline]
pub fn operand_size(opcode: u8) -> usize {
    OPCODE_TABLE[opcode as usize].operand as usize
}

/// Total length of the instruction starting at `offset`.
///
/// Returns 0 when `offset` is past the end. Unknown opcodes report 1, which
/// keeps a scan moving but can desynchronize it on a genuinely unknown
/// multi-byte instruction; producers only ever emit table opcodes.
#[inline]
pub fn instruction_length(code: &[u8], offset: usize) -> usize {
    match code.get(offset) {
        Some(&op) => OPCODE_TABLE[op as usize].length as usize,
        None => 0,
    }
}

/// Walks instruction boundaries of an encoded stream.
pub struct Instructions<'a> {
    code: &'a [u8],
    offset: usize,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Instructions { code, offset: 0 }
    }
}

impl<'a> Iterator for Instructions<'a> {
    /// (offset, raw opcode byte, length)
    type Item = (usize, u8, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let len = instruction_length(self.code, self.offset);
        if len == 0 {
            return None;
        }
        let item = (self.offset, self.code[self.offset], len);
        self.offset += len;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_shapes() {
        assert_eq!(Opcode::LoadConst.length(), 4);
        assert_eq!(Opcode::LoadI32Const.length(), 4);
        assert_eq!(Opcode::MoveI32.length(), 3);
        assert_eq!(Opcode::JumpShort.length(), 2);
        assert_eq!(Opcode::JumpIfNotShort.length(), 3);
        assert_eq!(Opcode::BranchTyped.length(), 6);
        assert_eq!(Opcode::Halt.length(), 1);
        assert_eq!(Opcode::ReturnVoid.length(), 1);
        assert_eq!(Opcode::Jump.length(), 3);
        assert_eq!(Opcode::JumpIfNotI32Typed.length(), 5);
    }

    #[test]
    fn arity_groups() {
        assert_eq!(Opcode::IncI32R.length(), 2);
        assert_eq!(Opcode::PrintR.length(), 2);
        assert_eq!(Opcode::TypeOfR.length(), 3);
        assert_eq!(Opcode::ParseIntR.length(), 3);
        assert_eq!(Opcode::AddI32R.length(), 4);
        assert_eq!(Opcode::IsTypeR.length(), 4);
        assert_eq!(Opcode::AddI64Typed.length(), 4);
        assert_eq!(Opcode::EnumNewR.length(), 9);
    }

    #[test]
    fn prefix_and_operand_sizes() {
        assert_eq!(prefix_size(Opcode::BranchTyped as u8), 4);
        assert_eq!(prefix_size(Opcode::JumpIfNotR as u8), 2);
        assert_eq!(prefix_size(Opcode::JumpIfR as u8), 2);
        assert_eq!(prefix_size(Opcode::TryBegin as u8), 2);
        assert_eq!(prefix_size(Opcode::JumpIfNotShort as u8), 2);
        assert_eq!(prefix_size(Opcode::JumpIfNotI32Typed as u8), 3);
        assert_eq!(prefix_size(Opcode::Jump as u8), 1);
        assert_eq!(prefix_size(Opcode::AddI32R as u8), 1);

        assert_eq!(operand_size(Opcode::JumpShort as u8), 1);
        assert_eq!(operand_size(Opcode::JumpBackShort as u8), 1);
        assert_eq!(operand_size(Opcode::JumpIfNotShort as u8), 1);
        assert_eq!(operand_size(Opcode::LoopShort as u8), 1);
        assert_eq!(operand_size(Opcode::Jump as u8), 2);
        assert_eq!(operand_size(Opcode::Loop as u8), 2);
    }

    #[test]
    fn unknown_opcode_is_one_byte() {
        assert!(Opcode::from_byte(0xFE).is_none());
        assert_eq!(instruction_length(&[0xFE, 0x00], 0), 1);
    }

    #[test]
    fn out_of_range_offset_is_zero() {
        let code = [Opcode::Halt as u8];
        assert_eq!(instruction_length(&code, 1), 0);
        assert_eq!(instruction_length(&[], 0), 0);
    }

    #[test]
    fn every_opcode_round_trips_its_byte() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
            assert!(op.length() >= 1);
        }
    }

    #[test]
    fn walking_lengths_lands_on_count() {
        // one of every opcode, each with zeroed operands
        let mut code = Vec::new();
        for &op in Opcode::ALL {
            code.push(op as u8);
            code.extend(std::iter::repeat_n(0u8, op.length() - 1));
        }
        let mut offset = 0;
        let mut seen = 0;
        while offset < code.len() {
            let len = instruction_length(&code, offset);
            assert!(len > 0);
            offset += len;
            seen += 1;
        }
        assert_eq!(offset, code.len());
        assert_eq!(seen, Opcode::ALL.len());
        assert_eq!(Instructions::new(&code).count(), Opcode::ALL.len());
    }
}
