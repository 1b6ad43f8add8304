use super::LinkedMethod;
use crate::util::Offset;
use crate::vm::{Error, FlowKind, Instruction, InstructionSet};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

/// Index of a block in its graph (blocks are numbered in address order)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub usize);

/// A maximal straight-line run of instructions
///
/// Control only enters at the first instruction and only leaves at the last one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    /// Address of the first instruction
    pub start: Offset,

    /// Range of instruction indices (into the method) covered by the block
    pub instructions: Range<usize>,

    /// Block reached by falling off the end of this one
    pub fallthrough: Option<BlockId>,

    /// Blocks reached by explicit jumps (including exception handlers)
    pub jump_targets: Vec<BlockId>,

    /// Blocks that have this one as a successor (sorted, no duplicates)
    pub predecessors: Vec<BlockId>,
}

/// Control flow graph of a linked method
///
/// Blocks are built once and never modified: passes that change the code should rebuild the
/// graph from the changed method.
#[derive(Debug)]
pub struct BasicBlockGraph<'m> {
    method: &'m LinkedMethod,
    blocks: Vec<BasicBlock>,
    terminators: Vec<FlowKind>,
}

impl<'m> BasicBlockGraph<'m> {
    /// Partition the method into basic blocks
    ///
    /// A new block starts at the first instruction, at every jump or handler target, and after
    /// every instruction that ends a block (jumps, conditional jumps, `TRY`, `ENDTRY`, and
    /// instructions that never fall through). Calls return to the next instruction, so they do
    /// not end blocks.
    pub fn build(
        method: &'m LinkedMethod,
        isa: &dyn InstructionSet,
    ) -> Result<BasicBlockGraph<'m>, Error> {
        let len = method.instructions.len();
        let mut flows = Vec::with_capacity(len);
        let mut targets: Vec<Vec<usize>> = Vec::with_capacity(len);
        let mut is_leader = vec![false; len];
        if len > 0 {
            is_leader[0] = true;
        }

        for (address, idx, insn) in &method.instructions {
            let flow = isa.lookup(insn.opcode)?.flow;
            let local_targets = match flow {
                FlowKind::Jump | FlowKind::Branch | FlowKind::Try | FlowKind::EndTry => insn
                    .targets()
                    .map(|relative| method.target_index(address, *relative))
                    .collect::<Result<Vec<usize>, Error>>()?,
                _ => vec![],
            };
            for target in &local_targets {
                is_leader[*target] = true;
            }
            if flow.ends_block() && idx + 1 < len {
                is_leader[idx + 1] = true;
            }
            flows.push(flow);
            targets.push(local_targets);
        }

        // Carve out blocks
        let mut block_of_insn = vec![BlockId(0); len];
        let mut ranges: Vec<Range<usize>> = vec![];
        for idx in 0..len {
            if is_leader[idx] {
                ranges.push(idx..idx + 1);
            } else if let Some(range) = ranges.last_mut() {
                range.end = idx + 1;
            }
            block_of_insn[idx] = BlockId(ranges.len() - 1);
        }

        let mut blocks: Vec<BasicBlock> = Vec::with_capacity(ranges.len());
        let mut terminators = Vec::with_capacity(ranges.len());
        for (block_idx, range) in ranges.into_iter().enumerate() {
            let last = range.end - 1;
            let flow = flows[last];
            let next_block = Some(BlockId(block_idx + 1)).filter(|_| range.end < len);
            let fallthrough = if flow.falls_through() {
                next_block
            } else {
                None
            };
            let jump_targets = targets[last]
                .iter()
                .map(|target| block_of_insn[*target])
                .collect();
            let start = method
                .instructions
                .offset_of_index(range.start)
                .unwrap_or_else(|| method.start());
            blocks.push(BasicBlock {
                start,
                instructions: range,
                fallthrough,
                jump_targets,
                predecessors: vec![],
            });
            terminators.push(flow);
        }

        // Derive predecessors
        let mut predecessors: Vec<Vec<BlockId>> = vec![vec![]; blocks.len()];
        for (block_idx, block) in blocks.iter().enumerate() {
            for successor in block.fallthrough.iter().chain(&block.jump_targets) {
                predecessors[successor.0].push(BlockId(block_idx));
            }
        }
        for (block, mut preds) in blocks.iter_mut().zip(predecessors) {
            preds.sort();
            preds.dedup();
            block.predecessors = preds;
        }

        Ok(BasicBlockGraph {
            method,
            blocks,
            terminators,
        })
    }

    pub fn method(&self) -> &'m LinkedMethod {
        self.method
    }

    /// Entry block (there is none for an empty method)
    pub fn entry(&self) -> Option<BlockId> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(BlockId(0))
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks, in address order
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    /// Block containing the instruction at an address
    pub fn block_at_address(&self, address: Offset) -> Option<BlockId> {
        if address < self.method.start() || address >= self.method.end() {
            return None;
        }
        let idx = self.blocks.partition_point(|block| block.start <= address);
        idx.checked_sub(1).map(BlockId)
    }

    /// Block whose first instruction is at the given index
    pub fn block_starting_at(&self, instruction: usize) -> Option<BlockId> {
        self.blocks
            .binary_search_by_key(&instruction, |block| block.instructions.start)
            .ok()
            .map(BlockId)
    }

    /// Fallthrough successor (if any) then jump successors
    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        let block = self.block(id);
        block
            .fallthrough
            .into_iter()
            .chain(block.jump_targets.iter().copied())
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.block(id).predecessors
    }

    /// How control leaves the block
    pub fn terminator_flow(&self, id: BlockId) -> FlowKind {
        self.terminators[id.0]
    }

    /// Instructions in the block, along with their addresses
    pub fn instructions(
        &self,
        id: BlockId,
    ) -> impl Iterator<Item = (Offset, &'m Instruction<i32>)> + '_ {
        let method = self.method;
        self.block(id)
            .instructions
            .clone()
            .filter_map(move |idx| method.instructions.get_index(idx))
    }

    /// Which blocks can be reached from the entry?
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut queue: VecDeque<BlockId> = self.entry().into_iter().collect();
        if let Some(entry) = self.entry() {
            seen[entry.0] = true;
        }
        while let Some(id) = queue.pop_front() {
            for successor in self.successors(id) {
                if !seen[successor.0] {
                    seen[successor.0] = true;
                    queue.push_back(successor);
                }
            }
        }
        seen
    }

    /// Blocks with no predecessors which are not the entry
    ///
    /// Note that this is a local property: a cycle of blocks that cannot be reached from the
    /// entry is not reported (and a block that jumps to itself is never reported).
    pub fn unreachable_blocks(&self) -> Vec<BlockId> {
        (1..self.blocks.len())
            .map(BlockId)
            .filter(|id| self.predecessors(*id).is_empty())
            .collect()
    }

    /// Is the block just an unconditional jump?
    pub fn is_jump_only(&self, id: BlockId) -> bool {
        self.block(id).instructions.len() == 1 && self.terminators[id.0] == FlowKind::Jump
    }

    pub fn jump_only_blocks(&self) -> Vec<BlockId> {
        (0..self.blocks.len())
            .map(BlockId)
            .filter(|id| self.is_jump_only(*id))
            .collect()
    }

    /// Blocks ending in a conditional jump
    pub fn branch_points(&self) -> Vec<BlockId> {
        (0..self.blocks.len())
            .map(BlockId)
            .filter(|id| self.terminators[id.0] == FlowKind::Branch)
            .collect()
    }

    /// Map externally collected hit counts (keyed by instruction address) onto the blocks
    ///
    /// A block counts as hit as many times as its first instruction was. A branch counts as
    /// covered when both its fallthrough and its jump target were hit.
    pub fn coverage(&self, hits: &HashMap<Offset, u64>) -> Coverage {
        let hits_at = |id: BlockId| hits.get(&self.block(id).start).copied().unwrap_or(0);
        let blocks: Vec<BlockCoverage> = (0..self.blocks.len())
            .map(|idx| BlockCoverage {
                block: BlockId(idx),
                hits: hits_at(BlockId(idx)),
            })
            .collect();
        let branches = self
            .branch_points()
            .into_iter()
            .map(|id| {
                let block = self.block(id);
                BranchCoverage {
                    block: id,
                    fallthrough_hit: block.fallthrough.map_or(false, |next| hits_at(next) > 0),
                    jump_hit: block.jump_targets.iter().any(|target| hits_at(*target) > 0),
                }
            })
            .collect();
        Coverage { blocks, branches }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCoverage {
    pub block: BlockId,
    pub hits: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchCoverage {
    pub block: BlockId,
    pub fallthrough_hit: bool,
    pub jump_hit: bool,
}

impl BranchCoverage {
    /// Were both outcomes observed?
    pub fn is_covered(&self) -> bool {
        self.fallthrough_hit && self.jump_hit
    }
}

/// Per-block and per-branch hit accounting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coverage {
    pub blocks: Vec<BlockCoverage>,
    pub branches: Vec<BranchCoverage>,
}

impl Coverage {
    /// Fraction of blocks hit at least once
    pub fn block_hit_rate(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        let hit = self.blocks.iter().filter(|block| block.hits > 0).count();
        hit as f64 / self.blocks.len() as f64
    }

    /// Fraction of branch outcomes observed (each branch has two)
    pub fn branch_hit_rate(&self) -> f64 {
        if self.branches.is_empty() {
            return 0.0;
        }
        let outcomes: usize = self
            .branches
            .iter()
            .map(|branch| branch.fallthrough_hit as usize + branch.jump_hit as usize)
            .sum();
        outcomes as f64 / (2 * self.branches.len()) as f64
    }
}
