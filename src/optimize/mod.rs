//! Optimization passes over symbolic method code
//!
//! Passes rewrite [`MethodCode`] in place, but decide what to rewrite using the
//! [`BasicBlockGraph`] of the linked program. The program is relinked whenever a pass needs an
//! up-to-date graph. All passes are repeated until none of them changes anything (or a round
//! limit is hit).

use crate::vm::code::{link, BasicBlockGraph, Label, MethodCode, Program, Target};
use crate::vm::{Error, FlowKind, Instruction, InstructionSet, OpCode, Operand};
use std::collections::HashSet;

/// Upper bound on the number of times all passes are run
const MAX_ROUNDS: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub rounds: usize,

    /// Conditional jumps on a constant that were replaced or dropped
    pub folded_branches: usize,

    /// Jumps retargeted past a chain of unconditional jumps
    pub threaded_jumps: usize,

    /// Instructions removed with unreachable blocks
    pub removed_instructions: usize,

    /// Unconditional jumps to the very next instruction that were removed
    pub removed_jumps: usize,
}

impl OptimizeStats {
    /// Total number of rewrites done
    pub fn changes(&self) -> usize {
        self.folded_branches + self.threaded_jumps + self.removed_instructions + self.removed_jumps
    }
}

/// Optimize every method of a program
pub fn optimize(program: &mut Program, isa: &dyn InstructionSet) -> Result<OptimizeStats, Error> {
    let mut stats = OptimizeStats::default();

    while stats.rounds < MAX_ROUNDS {
        stats.rounds += 1;
        let before = stats.changes();

        for method in &mut program.methods {
            stats.folded_branches += fold_constant_branches(method);
        }

        let linked = link(program, isa)?;
        for (method, linked) in program.methods.iter_mut().zip(&linked.methods) {
            let graph = BasicBlockGraph::build(linked, isa)?;
            stats.threaded_jumps += thread_jumps(method, &graph, isa)?;
        }

        loop {
            let linked = link(program, isa)?;
            let mut removed = 0;
            for (method, linked) in program.methods.iter_mut().zip(&linked.methods) {
                let graph = BasicBlockGraph::build(linked, isa)?;
                removed += remove_unreachable_blocks(method, &graph);
            }
            if removed == 0 {
                break;
            }
            stats.removed_instructions += removed;
        }

        for method in &mut program.methods {
            stats.removed_jumps += remove_jumps_to_next(method);
        }

        log::trace!("optimizer round {}: {:?}", stats.rounds, stats);
        if stats.changes() == before {
            break;
        }
    }

    log::debug!(
        "optimized {} methods in {} rounds",
        program.methods.len(),
        stats.rounds
    );
    Ok(stats)
}

/// Replace `PUSHT`/`PUSHF` followed by a conditional jump with either an unconditional jump or
/// nothing
///
/// A pair is left alone if a label is placed between the two instructions, since then the
/// condition is not always the constant.
fn fold_constant_branches(method: &mut MethodCode) -> usize {
    let placed: HashSet<usize> = method
        .labels
        .iter()
        .filter_map(|(_, position)| position)
        .collect();

    let len = method.instructions.len();
    let mut keep = vec![true; len];
    let mut folded = 0;
    let mut idx = 0;
    while idx + 1 < len {
        let constant = match method.instructions[idx].opcode {
            OpCode::PUSHT => Some(true),
            OpCode::PUSHF => Some(false),
            _ => None,
        };
        let jump_if = match method.instructions[idx + 1].opcode {
            OpCode::JMPIF => Some(true),
            OpCode::JMPIFNOT => Some(false),
            _ => None,
        };
        let target = match &method.instructions[idx + 1].operand {
            Operand::Jump(target, _) => Some(*target),
            _ => None,
        };

        match (constant, jump_if, target) {
            (Some(constant), Some(jump_if), Some(target)) if !placed.contains(&(idx + 1)) => {
                keep[idx] = false;
                if constant == jump_if {
                    method.instructions[idx + 1] = Instruction::jump(OpCode::JMP, target);
                } else {
                    keep[idx + 1] = false;
                }
                folded += 1;
                idx += 2;
            }
            _ => idx += 1,
        }
    }

    if folded > 0 {
        method.retain(&keep);
    }
    folded
}

/// Retarget jumps whose target block is just `JMP X` (possibly repeatedly) to the end of the
/// chain
///
/// Chains that loop back on themselves stop at the first block seen twice.
fn thread_jumps(
    method: &mut MethodCode,
    graph: &BasicBlockGraph,
    isa: &dyn InstructionSet,
) -> Result<usize, Error> {
    let mut threaded = 0;
    for site in 0..method.instructions.len() {
        let flow = isa.lookup(method.instructions[site].opcode)?.flow;
        if !matches!(flow, FlowKind::Jump | FlowKind::Branch | FlowKind::EndTry) {
            continue;
        }
        let start = match &method.instructions[site].operand {
            Operand::Jump(Target::Label(label), _) => *label,
            _ => continue,
        };

        let mut label = start;
        let mut visited = HashSet::new();
        while let Some(next) = jump_only_target(method, graph, label) {
            if !visited.insert(label) {
                break;
            }
            label = next;
        }

        if label != start {
            method.labels.unreference(start, site)?;
            method.labels.reference(label, site)?;
            if let Operand::Jump(target, _) = &mut method.instructions[site].operand {
                *target = Target::Label(label);
            }
            threaded += 1;
        }
    }
    Ok(threaded)
}

/// If the label starts a block which is only an unconditional jump, the target of that jump
fn jump_only_target(method: &MethodCode, graph: &BasicBlockGraph, label: Label) -> Option<Label> {
    let position = method.labels.position(label)?;
    let block = graph.block_starting_at(position)?;
    if !graph.is_jump_only(block) {
        return None;
    }
    match &method.instructions.get(position)?.operand {
        Operand::Jump(Target::Label(next), _) => Some(*next),
        _ => None,
    }
}

/// Remove the blocks that nothing jumps or falls into (except for the entry)
fn remove_unreachable_blocks(method: &mut MethodCode, graph: &BasicBlockGraph) -> usize {
    let unreachable = graph.unreachable_blocks();
    if unreachable.is_empty() {
        return 0;
    }

    let mut keep = vec![true; method.instructions.len()];
    let mut removed = 0;
    for block in unreachable {
        for idx in graph.block(block).instructions.clone() {
            keep[idx] = false;
            removed += 1;
        }
    }
    log::trace!("`{}`: removing {} dead instructions", method.name, removed);
    method.retain(&keep);
    removed
}

/// Remove `JMP`s to the instruction right after them
fn remove_jumps_to_next(method: &mut MethodCode) -> usize {
    let keep: Vec<bool> = method
        .instructions
        .iter()
        .enumerate()
        .map(|(site, insn)| match &insn.operand {
            Operand::Jump(Target::Label(label), _) if insn.opcode == OpCode::JMP => {
                method.labels.position(*label) != Some(site + 1)
            }
            _ => true,
        })
        .collect();

    let removed = keep.iter().filter(|kept| !**kept).count();
    if removed > 0 {
        method.retain(&keep);
    }
    removed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::code::CodeBuffer;
    use crate::vm::StandardInstructionSet;

    fn method(build: impl FnOnce(&mut CodeBuffer)) -> MethodCode {
        let isa = StandardInstructionSet;
        let mut buffer = CodeBuffer::new(&isa);
        build(&mut buffer);
        buffer
            .finish(String::from("test"), 0, 0, Default::default())
            .unwrap()
    }

    fn op(buffer: &mut CodeBuffer, opcode: OpCode) {
        buffer.push(Instruction::simple(opcode)).unwrap();
    }

    fn jump(buffer: &mut CodeBuffer, opcode: OpCode, label: Label) {
        buffer
            .push(Instruction::jump(opcode, Target::Label(label)))
            .unwrap();
    }

    fn ret(buffer: &mut CodeBuffer, values: usize) {
        buffer
            .push_dynamic(Instruction::simple(OpCode::RET), values, 0)
            .unwrap();
    }

    fn optimize_one(method: MethodCode) -> (MethodCode, OptimizeStats) {
        let mut program = Program {
            methods: vec![method],
        };
        let stats = optimize(&mut program, &StandardInstructionSet).unwrap();
        (program.methods.remove(0), stats)
    }

    fn opcodes(method: &MethodCode) -> Vec<OpCode> {
        method.instructions.iter().map(|insn| insn.opcode).collect()
    }

    /// `if (false) return 1; return 2;`
    #[test]
    fn constant_branch_taken() {
        let code = method(|buffer| {
            let other = buffer.fresh_label();
            op(buffer, OpCode::PUSHF);
            jump(buffer, OpCode::JMPIFNOT, other);
            op(buffer, OpCode::PUSH1);
            ret(buffer, 1);
            buffer.place_label(other).unwrap();
            op(buffer, OpCode::PUSH2);
            ret(buffer, 1);
        });
        let (code, stats) = optimize_one(code);
        assert_eq!(opcodes(&code), vec![OpCode::PUSH2, OpCode::RET]);
        assert_eq!(stats.folded_branches, 1);
        assert_eq!(stats.removed_instructions, 2);
        assert_eq!(stats.removed_jumps, 1);
    }

    #[test]
    fn constant_branch_not_taken() {
        let code = method(|buffer| {
            let other = buffer.fresh_label();
            op(buffer, OpCode::PUSHT);
            jump(buffer, OpCode::JMPIFNOT, other);
            op(buffer, OpCode::PUSH1);
            ret(buffer, 1);
            buffer.place_label(other).unwrap();
            op(buffer, OpCode::PUSH2);
            ret(buffer, 1);
        });
        let (code, stats) = optimize_one(code);
        assert_eq!(opcodes(&code), vec![OpCode::PUSH1, OpCode::RET]);
        assert_eq!(stats.folded_branches, 1);
        assert_eq!(stats.removed_instructions, 2);
    }

    #[test]
    fn branches_behind_labels_are_not_folded() {
        let mut code = method(|buffer| {
            let again = buffer.fresh_label();
            let done = buffer.fresh_label();
            op(buffer, OpCode::PUSHT);
            buffer.place_label(again).unwrap();
            jump(buffer, OpCode::JMPIFNOT, done);
            op(buffer, OpCode::PUSHF);
            jump(buffer, OpCode::JMP, again);
            buffer.place_label(done).unwrap();
            ret(buffer, 0);
        });
        assert_eq!(fold_constant_branches(&mut code), 0);
        assert_eq!(code.instructions.len(), 5);
    }

    #[test]
    fn jump_chains_are_threaded() {
        let code = method(|buffer| {
            let a = buffer.fresh_label();
            let b = buffer.fresh_label();
            let c = buffer.fresh_label();
            op(buffer, OpCode::PUSH0);
            jump(buffer, OpCode::JMPIF, a);
            op(buffer, OpCode::PUSH1);
            ret(buffer, 1);
            buffer.place_label(a).unwrap();
            jump(buffer, OpCode::JMP, b);
            buffer.place_label(b).unwrap();
            jump(buffer, OpCode::JMP, c);
            buffer.place_label(c).unwrap();
            op(buffer, OpCode::PUSH2);
            ret(buffer, 1);
        });
        let (code, stats) = optimize_one(code);
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::PUSH0,
                OpCode::JMPIF,
                OpCode::PUSH1,
                OpCode::RET,
                OpCode::PUSH2,
                OpCode::RET
            ]
        );
        let target = match &code.instructions[1].operand {
            Operand::Jump(Target::Label(label), _) => *label,
            other => panic!("unexpected operand {:?}", other),
        };
        assert_eq!(code.labels.position(target), Some(4));
        assert_eq!(stats.threaded_jumps, 2);
        assert_eq!(stats.removed_instructions, 2);
    }

    #[test]
    fn jump_cycles_terminate() {
        let code = method(|buffer| {
            let a = buffer.fresh_label();
            let b = buffer.fresh_label();
            op(buffer, OpCode::PUSH0);
            jump(buffer, OpCode::JMPIF, a);
            ret(buffer, 0);
            buffer.place_label(a).unwrap();
            jump(buffer, OpCode::JMP, b);
            buffer.place_label(b).unwrap();
            jump(buffer, OpCode::JMP, a);
        });
        let (code, stats) = optimize_one(code);

        // `a: JMP b; b: JMP a` collapses into `a: JMP a`
        assert_eq!(
            opcodes(&code),
            vec![OpCode::PUSH0, OpCode::JMPIF, OpCode::RET, OpCode::JMP]
        );
        let target = match &code.instructions[3].operand {
            Operand::Jump(Target::Label(label), _) => *label,
            other => panic!("unexpected operand {:?}", other),
        };
        assert_eq!(code.labels.position(target), Some(3));
        assert_eq!(stats.threaded_jumps, 0);
        assert_eq!(stats.removed_jumps, 1);
        assert_eq!(stats.rounds, 2);
    }

    #[test]
    fn sequence_points_of_removed_code_are_dropped() {
        use crate::vm::debug_info::SourceSpan;

        let live = SourceSpan::new(0, 2, 1, 2, 10);
        let code = method(|buffer| {
            ret(buffer, 0);
            buffer.add_sequence_point(SourceSpan::new(0, 1, 1, 1, 10));
            op(buffer, OpCode::NOP);
            ret(buffer, 0);
        });
        let mut code = code;
        code.sequence_points.insert(0, (0, live));
        let (code, _) = optimize_one(code);
        assert_eq!(opcodes(&code), vec![OpCode::RET]);
        assert_eq!(code.sequence_points, vec![(0, live)]);
    }
}
