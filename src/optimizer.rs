//! Peephole optimizer
//!
//! Rewrites an encoded, not yet jump-resolved buffer in place. Instructions
//! are walked by their table length, never by fixed byte windows.

use serde::Serialize;

use crate::bytecode::{BytecodeBuffer, Opcode, instruction_length};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OptimizeError {
    #[error("jumps are already resolved; optimize before resolving")]
    JumpsAlreadyResolved,
}

/// Counters for one optimizer, accumulated across every buffer it runs on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub patterns_optimized: u32,
    pub instructions_eliminated: u32,
    pub load_move_fusions: u32,
    pub redundant_moves: u32,
    pub constant_propagations: u32,
}

impl OptimizerStats {
    pub fn merge(&mut self, other: OptimizerStats) {
        self.patterns_optimized += other.patterns_optimized;
        self.instructions_eliminated += other.instructions_eliminated;
        self.load_move_fusions += other.load_move_fusions;
        self.redundant_moves += other.redundant_moves;
        self.constant_propagations += other.constant_propagations;
    }
}

#[derive(Debug, Default)]
pub struct PeepholeOptimizer {
    stats: OptimizerStats,
}

impl PeepholeOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> OptimizerStats {
        self.stats
    }

    /// Runs every pass in order and returns what this call changed.
    pub fn optimize(&mut self, buffer: &mut BytecodeBuffer) -> Result<OptimizerStats, OptimizeError> {
        if buffer.jumps_resolved() {
            return Err(OptimizeError::JumpsAlreadyResolved);
        }
        let mut run = OptimizerStats::default();
        let before = buffer.len();

        run.load_move_fusions = fuse_load_moves(buffer);
        run.redundant_moves = remove_redundant_moves(buffer);
        run.constant_propagations = propagate_constants(buffer);

        run.patterns_optimized = run.load_move_fusions + run.redundant_moves + run.constant_propagations;
        run.instructions_eliminated = run.load_move_fusions + run.redundant_moves;
        self.stats.merge(run);

        tracing::debug!(
            bytes_before = before,
            bytes_after = buffer.len(),
            fusions = run.load_move_fusions,
            redundant_moves = run.redundant_moves,
            "peephole pass"
        );
        Ok(run)
    }
}

/// `LOAD_x Rt, k` followed by `MOVE_x Rd, Rt` becomes `LOAD_x Rd, k`.
///
/// One forward pass; a fused load is not examined again.
fn fuse_load_moves(buffer: &mut BytecodeBuffer) -> u32 {
    let mut fused = 0;
    let mut offset = 0;
    while offset < buffer.len() {
        let len = instruction_length(buffer.code(), offset);
        let next = offset + len;
        if next > buffer.len() {
            break;
        }
        let code = buffer.code();
        let load = Opcode::from_byte(code[offset]);
        let wanted_move = load.and_then(Opcode::matching_move);
        let next_len = instruction_length(code, next);
        let fusable = match wanted_move {
            Some(mv) => {
                next_len == mv.length()
                    && next + next_len <= code.len()
                    && code[next] == mv as u8
                    && code[next + 2] == code[offset + 1]
                    && !buffer.is_label_target(next)
            }
            None => false,
        };
        if fusable {
            let dest = code[next + 1];
            // field 1 is the load's destination register
            if buffer.patch_operand(offset, 1, dest).is_ok() && buffer.delete_range(next, next_len).is_ok() {
                fused += 1;
            }
        }
        offset = next;
    }
    fused
}

/// Deletes moves whose source is their destination. The same offset is
/// checked again after a deletion so consecutive no-ops all go.
fn remove_redundant_moves(buffer: &mut BytecodeBuffer) -> u32 {
    let mut removed = 0;
    let mut offset = 0;
    while offset < buffer.len() {
        let len = instruction_length(buffer.code(), offset);
        if offset + len > buffer.len() {
            break;
        }
        let code = buffer.code();
        let is_noop = Opcode::from_byte(code[offset]).is_some_and(Opcode::is_move) && code[offset + 1] == code[offset + 2];
        if is_noop && buffer.delete_range(offset, len).is_ok() {
            removed += 1;
        } else {
            offset += len;
        }
    }
    removed
}

/// Constant propagation is not implemented; reports no rewrites.
fn propagate_constants(_buffer: &mut BytecodeBuffer) -> u32 {
    0
}
