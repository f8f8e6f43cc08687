//! Basic-block graph over a raw instruction stream.
//!
//! Blocks are kept in one arena, ordered by stream position; a block's
//! index is its hierarchy number, and successors are derived from the
//! stored branch target positions rather than held as pointers.

use std::collections::BTreeSet;

use crate::base::{InstructionStream, Opcode, RawInstruction};

/// Arena index of a basic block; doubles as its hierarchy number.
pub type BlockId = usize;

#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Position of the first instruction in the block.
    pub start: usize,
    /// Straight-line instructions, terminator excluded.
    pub items: Vec<(usize, RawInstruction)>,
    /// Terminating branch, when the block ends with one.
    pub branch: Option<(usize, RawInstruction)>,
}

impl BasicBlock {
    /// True when control cannot fall through to the next block.
    pub fn is_terminal(&self) -> bool {
        if let Some((_, b)) = &self.branch {
            return b.opcode.is_branch_always();
        }
        matches!(
            self.items.last(),
            Some((_, i)) if matches!(i.opcode, Opcode::End | Opcode::Return)
        )
    }
}

#[derive(Debug, Clone)]
pub struct InstructionGraph {
    pub blocks: Vec<BasicBlock>,
}

impl InstructionGraph {
    pub fn build(stream: &InstructionStream) -> InstructionGraph {
        let mut leaders = BTreeSet::new();
        if let Some((first, _)) = stream.first() {
            leaders.insert(*first);
        }
        for (index, (_, instruction)) in stream.iter().enumerate() {
            if !instruction.opcode.is_branch() {
                continue;
            }
            if let Some(target) = instruction.branch_target() {
                leaders.insert(target);
            }
            if let Some((next, _)) = stream.get(index + 1) {
                leaders.insert(*next);
            }
        }

        let mut blocks: Vec<BasicBlock> = Vec::new();
        for (position, instruction) in stream {
            if leaders.contains(position) || blocks.is_empty() {
                blocks.push(BasicBlock { start: *position, items: Vec::new(), branch: None });
            }
            let block = blocks.last_mut().unwrap_or_else(|| unreachable!());
            if instruction.opcode.is_branch() {
                block.branch = Some((*position, instruction.clone()));
            } else {
                block.items.push((*position, instruction.clone()));
            }
        }
        InstructionGraph { blocks }
    }

    /// Index of the block starting exactly at `position`.
    pub fn block_at(&self, position: usize) -> Option<BlockId> {
        self.blocks.binary_search_by_key(&position, |b| b.start).ok()
    }

    /// Merge straight-line pairs and drop blocks no control edge reaches.
    /// Block granularity only; the instruction sequence of every surviving
    /// path is unchanged.
    pub fn optimize(mut self) -> InstructionGraph {
        self.drop_unreachable();
        self.merge_linear_pairs();
        self
    }

    fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let block = &self.blocks[id];
        let mut next = Vec::new();
        if let Some((_, branch)) = &block.branch {
            if let Some(target) = branch.branch_target() {
                if let Some(t) = self.block_at(target) {
                    next.push(t);
                }
            }
            if branch.opcode.is_conditional_branch() && id + 1 < self.blocks.len() {
                next.push(id + 1);
            }
        } else if !block.is_terminal() && id + 1 < self.blocks.len() {
            next.push(id + 1);
        }
        next
    }

    fn drop_unreachable(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        let mut reachable = vec![false; self.blocks.len()];
        let mut work = vec![0];
        while let Some(id) = work.pop() {
            if std::mem::replace(&mut reachable[id], true) {
                continue;
            }
            work.extend(self.successors(id));
        }
        let mut keep = reachable.iter();
        self.blocks.retain(|_| *keep.next().unwrap_or(&false));
    }

    fn merge_linear_pairs(&mut self) {
        loop {
            let candidate = (0..self.blocks.len().saturating_sub(1)).find(|&i| {
                self.blocks[i].branch.is_none()
                    && !self.blocks[i].is_terminal()
                    && self.predecessor_count(i + 1) == 1
            });
            let Some(i) = candidate else { break };
            let follower = self.blocks.remove(i + 1);
            let block = &mut self.blocks[i];
            block.items.extend(follower.items);
            block.branch = follower.branch;
        }
    }

    fn predecessor_count(&self, id: BlockId) -> usize {
        (0..self.blocks.len())
            .filter(|&p| self.successors(p).contains(&id))
            .count()
    }
}
