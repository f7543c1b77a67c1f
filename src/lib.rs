//! orus: a register-based bytecode virtual machine with a mark-sweep heap.

pub mod asm;
pub mod builtins;
pub mod bytecode;
pub mod config;
pub mod diagnostic;
pub mod heap;
pub mod optimizer;
pub mod strings;
pub mod value;
pub mod vm;

pub use asm::{AsmError, assemble};
pub use bytecode::{BytecodeBuffer, Chunk, CompiledProgram, ConstantPool, Opcode};
pub use config::VmConfig;
pub use heap::ObjectHeap;
pub use optimizer::PeepholeOptimizer;
pub use value::{ErrorKind, Value};
pub use vm::{ExecStats, Vm, VmError, VmIo};
