// ── Instruction table ────────────────────────────────────────────────
//
// Every opcode is described once, by its operand layout. Total length,
// prefix size and jump-operand size are all derived from that layout, so
// the encoder, optimizer, disassembler and engine cannot disagree.

/// One operand slot in an encoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// General (or typed) register index.
    Reg,
    /// Small unsigned immediate.
    Imm,
    /// Constant pool index, big-endian u16.
    Const,
    /// Global slot index.
    Global,
    /// Loop identifier tag, big-endian u16.
    LoopId,
    /// Forward jump distance, big-endian u16.
    JumpFwd,
    /// Backward jump distance, big-endian u16.
    JumpBack,
    /// Forward jump distance, one byte.
    JumpFwdShort,
    /// Backward jump distance, one byte.
    JumpBackShort,
}

impl Operand {
    pub const fn size(self) -> u8 {
        match self {
            Operand::Const | Operand::LoopId | Operand::JumpFwd | Operand::JumpBack => 2,
            _ => 1,
        }
    }

    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Operand::JumpFwd | Operand::JumpBack | Operand::JumpFwdShort | Operand::JumpBackShort
        )
    }

    pub const fn is_backward(self) -> bool {
        matches!(self, Operand::JumpBack | Operand::JumpBackShort)
    }
}

macro_rules! opcodes {
    ($( $variant:ident = $byte:literal, $name:literal, [$($operand:ident),*]; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $byte),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            pub const fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name),*
                }
            }

            pub const fn operands(self) -> &'static [Operand] {
                match self {
                    $(Opcode::$variant => &[$(Operand::$operand),*]),*
                }
            }
        }
    };
}

opcodes! {
    // constants, moves and globals
    LoadConst = 0x00, "LOAD_CONST", [Reg, Const];
    LoadTrue = 0x01, "LOAD_TRUE", [Reg];
    LoadFalse = 0x02, "LOAD_FALSE", [Reg];
    Move = 0x03, "MOVE", [Reg, Reg];
    LoadGlobal = 0x04, "LOAD_GLOBAL", [Reg, Global];
    StoreGlobal = 0x05, "STORE_GLOBAL", [Global, Reg];
    LoadI32Const = 0x06, "LOAD_I32_CONST", [Reg, Const];
    LoadI64Const = 0x07, "LOAD_I64_CONST", [Reg, Const];
    LoadF64Const = 0x08, "LOAD_F64_CONST", [Reg, Const];
    MoveI32 = 0x09, "MOVE_I32", [Reg, Reg];
    MoveI64 = 0x0A, "MOVE_I64", [Reg, Reg];
    MoveF64 = 0x0B, "MOVE_F64", [Reg, Reg];

    // register-addressed arithmetic: dst, lhs, rhs
    AddI32R = 0x10, "ADD_I32_R", [Reg, Reg, Reg];
    SubI32R = 0x11, "SUB_I32_R", [Reg, Reg, Reg];
    MulI32R = 0x12, "MUL_I32_R", [Reg, Reg, Reg];
    DivI32R = 0x13, "DIV_I32_R", [Reg, Reg, Reg];
    ModI32R = 0x14, "MOD_I32_R", [Reg, Reg, Reg];
    AddI64R = 0x15, "ADD_I64_R", [Reg, Reg, Reg];
    SubI64R = 0x16, "SUB_I64_R", [Reg, Reg, Reg];
    MulI64R = 0x17, "MUL_I64_R", [Reg, Reg, Reg];
    DivI64R = 0x18, "DIV_I64_R", [Reg, Reg, Reg];
    ModI64R = 0x19, "MOD_I64_R", [Reg, Reg, Reg];
    AddU32R = 0x1A, "ADD_U32_R", [Reg, Reg, Reg];
    SubU32R = 0x1B, "SUB_U32_R", [Reg, Reg, Reg];
    MulU32R = 0x1C, "MUL_U32_R", [Reg, Reg, Reg];
    DivU32R = 0x1D, "DIV_U32_R", [Reg, Reg, Reg];
    ModU32R = 0x1E, "MOD_U32_R", [Reg, Reg, Reg];
    AddU64R = 0x1F, "ADD_U64_R", [Reg, Reg, Reg];
    SubU64R = 0x20, "SUB_U64_R", [Reg, Reg, Reg];
    MulU64R = 0x21, "MUL_U64_R", [Reg, Reg, Reg];
    DivU64R = 0x22, "DIV_U64_R", [Reg, Reg, Reg];
    ModU64R = 0x23, "MOD_U64_R", [Reg, Reg, Reg];
    AddF64R = 0x24, "ADD_F64_R", [Reg, Reg, Reg];
    SubF64R = 0x25, "SUB_F64_R", [Reg, Reg, Reg];
    MulF64R = 0x26, "MUL_F64_R", [Reg, Reg, Reg];
    DivF64R = 0x27, "DIV_F64_R", [Reg, Reg, Reg];
    ModF64R = 0x28, "MOD_F64_R", [Reg, Reg, Reg];
    IncI32R = 0x29, "INC_I32_R", [Reg];
    DecI32R = 0x2A, "DEC_I32_R", [Reg];
    IncI64R = 0x2B, "INC_I64_R", [Reg];
    DecI64R = 0x2C, "DEC_I64_R", [Reg];
    NegI32R = 0x2D, "NEG_I32_R", [Reg, Reg];
    NegI64R = 0x2E, "NEG_I64_R", [Reg, Reg];
    NegF64R = 0x2F, "NEG_F64_R", [Reg, Reg];

    // bitwise on i32
    AndI32R = 0x30, "AND_I32_R", [Reg, Reg, Reg];
    OrI32R = 0x31, "OR_I32_R", [Reg, Reg, Reg];
    XorI32R = 0x32, "XOR_I32_R", [Reg, Reg, Reg];
    ShlI32R = 0x33, "SHL_I32_R", [Reg, Reg, Reg];
    ShrI32R = 0x34, "SHR_I32_R", [Reg, Reg, Reg];
    NotI32R = 0x35, "NOT_I32_R", [Reg, Reg];

    // comparisons: dst, lhs, rhs
    EqR = 0x38, "EQ_R", [Reg, Reg, Reg];
    NeR = 0x39, "NE_R", [Reg, Reg, Reg];
    LtI32R = 0x3A, "LT_I32_R", [Reg, Reg, Reg];
    LeI32R = 0x3B, "LE_I32_R", [Reg, Reg, Reg];
    GtI32R = 0x3C, "GT_I32_R", [Reg, Reg, Reg];
    GeI32R = 0x3D, "GE_I32_R", [Reg, Reg, Reg];
    LtI64R = 0x3E, "LT_I64_R", [Reg, Reg, Reg];
    LeI64R = 0x3F, "LE_I64_R", [Reg, Reg, Reg];
    GtI64R = 0x40, "GT_I64_R", [Reg, Reg, Reg];
    GeI64R = 0x41, "GE_I64_R", [Reg, Reg, Reg];
    LtU32R = 0x42, "LT_U32_R", [Reg, Reg, Reg];
    LeU32R = 0x43, "LE_U32_R", [Reg, Reg, Reg];
    GtU32R = 0x44, "GT_U32_R", [Reg, Reg, Reg];
    GeU32R = 0x45, "GE_U32_R", [Reg, Reg, Reg];
    LtU64R = 0x46, "LT_U64_R", [Reg, Reg, Reg];
    LeU64R = 0x47, "LE_U64_R", [Reg, Reg, Reg];
    GtU64R = 0x48, "GT_U64_R", [Reg, Reg, Reg];
    GeU64R = 0x49, "GE_U64_R", [Reg, Reg, Reg];
    LtF64R = 0x4A, "LT_F64_R", [Reg, Reg, Reg];
    LeF64R = 0x4B, "LE_F64_R", [Reg, Reg, Reg];
    GtF64R = 0x4C, "GT_F64_R", [Reg, Reg, Reg];
    GeF64R = 0x4D, "GE_F64_R", [Reg, Reg, Reg];
    AndBoolR = 0x4E, "AND_BOOL_R", [Reg, Reg, Reg];
    OrBoolR = 0x4F, "OR_BOOL_R", [Reg, Reg, Reg];
    NotBoolR = 0x50, "NOT_BOOL_R", [Reg, Reg];

    // conversions: dst, src
    I32ToI64R = 0x51, "I32_TO_I64_R", [Reg, Reg];
    I32ToF64R = 0x52, "I32_TO_F64_R", [Reg, Reg];
    I32ToU32R = 0x53, "I32_TO_U32_R", [Reg, Reg];
    I64ToI32R = 0x54, "I64_TO_I32_R", [Reg, Reg];
    I64ToF64R = 0x55, "I64_TO_F64_R", [Reg, Reg];
    I64ToU64R = 0x56, "I64_TO_U64_R", [Reg, Reg];
    U32ToI32R = 0x57, "U32_TO_I32_R", [Reg, Reg];
    U32ToF64R = 0x58, "U32_TO_F64_R", [Reg, Reg];
    U64ToI64R = 0x59, "U64_TO_I64_R", [Reg, Reg];
    U64ToF64R = 0x5A, "U64_TO_F64_R", [Reg, Reg];
    F64ToI32R = 0x5B, "F64_TO_I32_R", [Reg, Reg];
    F64ToI64R = 0x5C, "F64_TO_I64_R", [Reg, Reg];
    BoolToI32R = 0x5D, "BOOL_TO_I32_R", [Reg, Reg];
    I32ToBoolR = 0x5E, "I32_TO_BOOL_R", [Reg, Reg];

    // strings
    ConcatR = 0x60, "CONCAT_R", [Reg, Reg, Reg];
    ToStringR = 0x61, "TO_STRING_R", [Reg, Reg];
    StringIndexR = 0x62, "STRING_INDEX_R", [Reg, Reg, Reg];
    StringLenR = 0x63, "STRING_LEN_R", [Reg, Reg];
    SubstringR = 0x64, "SUBSTRING_R", [Reg, Reg, Reg, Reg];

    // arrays
    MakeArrayR = 0x68, "MAKE_ARRAY_R", [Reg, Reg, Imm];
    ArrayGetR = 0x69, "ARRAY_GET_R", [Reg, Reg, Reg];
    ArraySetR = 0x6A, "ARRAY_SET_R", [Reg, Reg, Reg];
    ArrayLenR = 0x6B, "ARRAY_LEN_R", [Reg, Reg];
    ArrayPushR = 0x6C, "ARRAY_PUSH_R", [Reg, Reg];
    ArrayPopR = 0x6D, "ARRAY_POP_R", [Reg, Reg];
    ArraySortedR = 0x6E, "ARRAY_SORTED_R", [Reg, Reg];
    ArraySliceR = 0x6F, "ARRAY_SLICE_R", [Reg, Reg, Reg, Reg];

    // enums: dst, variant index, payload count, payload start, type name, variant name
    EnumNewR = 0x70, "ENUM_NEW_R", [Reg, Imm, Imm, Reg, Const, Const];
    EnumTagEqR = 0x71, "ENUM_TAG_EQ_R", [Reg, Reg, Imm];
    EnumPayloadR = 0x72, "ENUM_PAYLOAD_R", [Reg, Reg, Imm, Imm];

    // iterators
    GetIterR = 0x74, "GET_ITER_R", [Reg, Reg];
    IterNextR = 0x75, "ITER_NEXT_R", [Reg, Reg, Reg];

    // errors
    TryBegin = 0x78, "TRY_BEGIN", [Reg, JumpFwd];
    TryEnd = 0x79, "TRY_END", [];
    Throw = 0x7A, "THROW", [Reg];

    // control flow
    Jump = 0x80, "JUMP", [JumpFwd];
    JumpIfR = 0x81, "JUMP_IF_R", [Reg, JumpFwd];
    JumpIfNotR = 0x82, "JUMP_IF_NOT_R", [Reg, JumpFwd];
    JumpIfNotI32Typed = 0x83, "JUMP_IF_NOT_I32_TYPED", [Reg, Reg, JumpFwd];
    Loop = 0x84, "LOOP", [JumpBack];
    JumpShort = 0x85, "JUMP_SHORT", [JumpFwdShort];
    JumpBackShort = 0x86, "JUMP_BACK_SHORT", [JumpBackShort];
    JumpIfNotShort = 0x87, "JUMP_IF_NOT_SHORT", [Reg, JumpFwdShort];
    LoopShort = 0x88, "LOOP_SHORT", [JumpBackShort];
    BranchTyped = 0x89, "BRANCH_TYPED", [LoopId, Reg, JumpFwd];

    // calls: callee, first arg, argc, result
    CallR = 0x90, "CALL_R", [Reg, Reg, Imm, Reg];
    ReturnR = 0x91, "RETURN_R", [Reg];
    ReturnVoid = 0x92, "RETURN_VOID", [];
    ClosureR = 0x93, "CLOSURE_R", [Reg, Reg, Reg, Imm];
    GetUpvalueR = 0x94, "GET_UPVALUE_R", [Reg, Imm];
    SetUpvalueR = 0x95, "SET_UPVALUE_R", [Imm, Reg];

    // builtins
    PrintR = 0x98, "PRINT_R", [Reg];
    PrintNoNlR = 0x99, "PRINT_NO_NL_R", [Reg];
    PrintMultiR = 0x9A, "PRINT_MULTI_R", [Reg, Imm, Imm];
    InputR = 0x9B, "INPUT_R", [Reg, Imm, Reg];
    RangeR = 0x9C, "RANGE_R", [Reg, Imm, Reg];
    ParseIntR = 0x9D, "PARSE_INT_R", [Reg, Reg];
    ParseFloatR = 0x9E, "PARSE_FLOAT_R", [Reg, Reg];
    TypeOfR = 0x9F, "TYPE_OF_R", [Reg, Reg];
    IsTypeR = 0xA0, "IS_TYPE_R", [Reg, Reg, Reg];

    // fast typed bank (T0..T63)
    AddI32Typed = 0xA8, "ADD_I32_TYPED", [Reg, Reg, Reg];
    SubI32Typed = 0xA9, "SUB_I32_TYPED", [Reg, Reg, Reg];
    MulI32Typed = 0xAA, "MUL_I32_TYPED", [Reg, Reg, Reg];
    DivI32Typed = 0xAB, "DIV_I32_TYPED", [Reg, Reg, Reg];
    ModI32Typed = 0xAC, "MOD_I32_TYPED", [Reg, Reg, Reg];
    AddI64Typed = 0xAD, "ADD_I64_TYPED", [Reg, Reg, Reg];
    SubI64Typed = 0xAE, "SUB_I64_TYPED", [Reg, Reg, Reg];
    MulI64Typed = 0xAF, "MUL_I64_TYPED", [Reg, Reg, Reg];
    DivI64Typed = 0xB0, "DIV_I64_TYPED", [Reg, Reg, Reg];
    ModI64Typed = 0xB1, "MOD_I64_TYPED", [Reg, Reg, Reg];
    AddF64Typed = 0xB2, "ADD_F64_TYPED", [Reg, Reg, Reg];
    SubF64Typed = 0xB3, "SUB_F64_TYPED", [Reg, Reg, Reg];
    MulF64Typed = 0xB4, "MUL_F64_TYPED", [Reg, Reg, Reg];
    DivF64Typed = 0xB5, "DIV_F64_TYPED", [Reg, Reg, Reg];
    LtI32Typed = 0xB6, "LT_I32_TYPED", [Reg, Reg, Reg];
    LeI32Typed = 0xB7, "LE_I32_TYPED", [Reg, Reg, Reg];
    GtI32Typed = 0xB8, "GT_I32_TYPED", [Reg, Reg, Reg];
    GeI32Typed = 0xB9, "GE_I32_TYPED", [Reg, Reg, Reg];

    // runtime services
    TimeStamp = 0xC0, "TIME_STAMP", [Reg];
    GcPause = 0xC1, "GC_PAUSE", [];
    GcResume = 0xC2, "GC_RESUME", [];
    Halt = 0xFF, "HALT", [];
}

/// Static metadata for one opcode byte.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub opcode: Option<Opcode>,
    /// Total encoded length including the opcode byte.
    pub length: u8,
    /// Bytes before the jump-offset operand (1 when there is none).
    pub prefix: u8,
    /// Width of the jump-offset operand (2 when there is none).
    pub operand: u8,
}

const UNKNOWN: OpInfo = OpInfo { opcode: None, length: 1, prefix: 1, operand: 2 };

const fn describe(op: Opcode) -> OpInfo {
    let operands = op.operands();
    let mut length = 1u8;
    let mut prefix = 1u8;
    let mut operand = 2u8;
    let mut i = 0;
    while i < operands.len() {
        let o = operands[i];
        if o.is_jump() {
            prefix = length;
            operand = o.size();
        }
        length += o.size();
        i += 1;
    }
    OpInfo { opcode: Some(op), length, prefix, operand }
}

const fn build_table() -> [OpInfo; 256] {
    let mut table = [UNKNOWN; 256];
    let mut byte = 0usize;
    while byte < 256 {
        if let Some(op) = Opcode::from_byte(byte as u8) {
            table[byte] = describe(op);
        }
        byte += 1;
    }
    table
}

pub static OPCODE_TABLE: [OpInfo; 256] = build_table();

impl Opcode {
    #[inline(always)]
    pub fn info(self) -> &'static OpInfo {
        &OPCODE_TABLE[self as usize]
    }

    #[inline(always)]
    pub fn length(self) -> usize {
        self.info().length as usize
    }

    /// Looks up an opcode by its assembler mnemonic.
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.mnemonic().eq_ignore_ascii_case(name))
    }

    /// The jump operand of this opcode, if it has one.
    pub fn jump_operand(self) -> Option<Operand> {
        self.operands().iter().copied().find(|o| o.is_jump())
    }

    pub fn is_constant_load(self) -> bool {
        matches!(
            self,
            Opcode::LoadConst | Opcode::LoadI32Const | Opcode::LoadI64Const | Opcode::LoadF64Const
        )
    }

    pub fn is_move(self) -> bool {
        matches!(self, Opcode::Move | Opcode::MoveI32 | Opcode::MoveI64 | Opcode::MoveF64)
    }

    /// The move that carries the value produced by a constant load.
    pub fn matching_move(self) -> Option<Opcode> {
        match self {
            Opcode::LoadConst => Some(Opcode::Move),
            Opcode::LoadI32Const => Some(Opcode::MoveI32),
            Opcode::LoadI64Const => Some(Opcode::MoveI64),
            Opcode::LoadF64Const => Some(Opcode::MoveF64),
            _ => None,
        }
    }
}
