//! Structurizer: folds the block graph into sequence / case / loop chains.
//!
//! Chains live in a single arena and refer to each other by id. A `Span`
//! is a raw run of blocks identified by hierarchy indices; condition spans
//! keep their final conditional branch, which the replay consumes as the
//! structure's test expression.

use crate::base::Opcode;
use crate::decompile::graph::InstructionGraph;
use crate::decompile::Diagnostic;

pub type ChainId = usize;

/// Inclusive run of blocks `[first..=last]`; empty when `first > last`.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub first: usize,
    pub last: usize,
}

impl Span {
    pub fn new(first: usize, last: usize) -> Span {
        Span { first, last }
    }

    pub fn empty() -> Span {
        Span { first: 1, last: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }
}

#[derive(Debug)]
pub enum Chain {
    Sequence(Vec<ChainId>),
    Raw(Span),
    Case {
        /// Blocks computing the test; the final block carries the branch.
        condition: Span,
        opcode: Opcode,
        /// Arm entered when the branch is taken.
        taken: ChainId,
        /// Arm entered on fall-through.
        fallthrough: ChainId,
        /// Jump target that rejoins the arms, when one exists.
        reconvergence: Option<usize>,
    },
    Loop {
        condition: Span,
        /// None for a `while (true)` shape built from a bare back jump.
        opcode: Option<Opcode>,
        post_test: bool,
        /// Position the back edge returns to.
        head: usize,
        /// Position just past the loop, when known.
        exit: Option<usize>,
        body: ChainId,
    },
}

#[derive(Debug, Default)]
pub struct ChainForest {
    pub chains: Vec<Chain>,
}

impl ChainForest {
    pub fn alloc(&mut self, chain: Chain) -> ChainId {
        self.chains.push(chain);
        self.chains.len() - 1
    }

    pub fn get(&self, id: ChainId) -> &Chain {
        &self.chains[id]
    }
}

pub fn structurize(
    graph: &InstructionGraph,
    diagnostics: &mut Vec<Diagnostic>,
) -> (ChainForest, ChainId) {
    let mut forest = ChainForest::default();
    let root = if graph.blocks.is_empty() {
        forest.alloc(Chain::Sequence(Vec::new()))
    } else {
        parse_range(graph, 0, graph.blocks.len() - 1, &mut forest, diagnostics)
    };
    (forest, root)
}

fn parse_range(
    graph: &InstructionGraph,
    s: usize,
    e: usize,
    forest: &mut ChainForest,
    diagnostics: &mut Vec<Diagnostic>,
) -> ChainId {
    let mut children = Vec::new();
    if s > e || graph.blocks.is_empty() {
        return forest.alloc(Chain::Sequence(children));
    }

    let mut run_start = s;
    let mut i = s;
    while i <= e {
        let block = &graph.blocks[i];
        let Some((branch_pos, branch)) = block.branch.clone() else {
            i += 1;
            continue;
        };
        let Some(target_pos) = branch.branch_target() else {
            diagnostics.push(Diagnostic::at(branch_pos, "branch without a target operand"));
            i += 1;
            continue;
        };
        let Some(target) = graph.block_at(target_pos) else {
            // jumps out of the range we were handed stay raw; the span
            // replay renders the sensible break/continue/marker form
            i += 1;
            continue;
        };

        if branch.opcode.is_branch_always() {
            if target <= i && target >= run_start {
                // bare back edge: while (true)
                if target > run_start {
                    children.push(forest.alloc(Chain::Raw(Span::new(run_start, target - 1))));
                }
                let body = forest.alloc(Chain::Raw(Span::new(target, i)));
                children.push(forest.alloc(Chain::Loop {
                    condition: Span::empty(),
                    opcode: None,
                    post_test: true,
                    head: target_pos,
                    exit: next_start(graph, i),
                    body,
                }));
                i += 1;
                run_start = i;
            } else {
                // forward or range-crossing jumps stay raw
                i += 1;
            }
            continue;
        }

        if target <= i {
            // conditional back edge: do/while over [target..=i]
            if target < run_start {
                diagnostics.push(Diagnostic::at(
                    branch_pos,
                    "loop head crosses an enclosing structure, left unstructured",
                ));
                i += 1;
                continue;
            }
            if target > run_start {
                children.push(forest.alloc(Chain::Raw(Span::new(run_start, target - 1))));
            }
            let body = forest.alloc(Chain::Sequence(Vec::new()));
            children.push(forest.alloc(Chain::Loop {
                condition: Span::new(target, i),
                opcode: Some(branch.opcode),
                post_test: true,
                head: target_pos,
                exit: next_start(graph, i),
                body,
            }));
            i += 1;
            run_start = i;
            continue;
        }

        let target = target.min(e + 1);

        // pre-test while: the block just before the exit target jumps back
        // to the start of the condition computation
        let while_head = back_jump(graph, target, run_start, i);
        if let Some((head_block, head_pos)) = while_head {
            if head_block > run_start {
                children.push(forest.alloc(Chain::Raw(Span::new(run_start, head_block - 1))));
            }
            let body = parse_range(graph, i + 1, target - 1, forest, diagnostics);
            children.push(forest.alloc(Chain::Loop {
                condition: Span::new(head_block, i),
                opcode: Some(branch.opcode),
                post_test: false,
                head: head_pos,
                exit: graph.blocks.get(target).map(|b| b.start),
                body,
            }));
            i = target;
            run_start = target;
            continue;
        }

        // if/else: fall-through arm runs up to the branch target, the taken
        // arm from the target to the reconvergence point
        let (reconvergence, recon_pos) = forward_jump_out(graph, target, i)
            .map(|(r, p)| (r.min(e + 1), Some(p)))
            .unwrap_or((target, None));
        let condition = Span::new(run_start, i);
        let fallthrough = parse_range(graph, i + 1, target - 1, forest, diagnostics);
        let taken = if reconvergence > target {
            parse_range(graph, target, reconvergence - 1, forest, diagnostics)
        } else {
            forest.alloc(Chain::Sequence(Vec::new()))
        };
        children.push(forest.alloc(Chain::Case {
            condition,
            opcode: branch.opcode,
            taken,
            fallthrough,
            reconvergence: recon_pos,
        }));
        i = reconvergence;
        run_start = reconvergence;
    }

    if run_start <= e {
        children.push(forest.alloc(Chain::Raw(Span::new(run_start, e))));
    }
    match children.len() {
        1 => children[0],
        _ => forest.alloc(Chain::Sequence(children)),
    }
}

fn next_start(graph: &InstructionGraph, id: usize) -> Option<usize> {
    graph.blocks.get(id + 1).map(|b| b.start)
}

/// The `BranchAlways` closing a pre-test loop: sits in the block before
/// `exit_block` and targets a block inside `[low..=high]`.
fn back_jump(
    graph: &InstructionGraph,
    exit_block: usize,
    low: usize,
    high: usize,
) -> Option<(usize, usize)> {
    if exit_block == 0 || exit_block - 1 <= high {
        return None;
    }
    let (_, jump) = graph.blocks.get(exit_block - 1)?.branch.as_ref()?;
    if !jump.opcode.is_branch_always() {
        return None;
    }
    let head_pos = jump.branch_target()?;
    let head_block = graph.block_at(head_pos)?;
    (head_block >= low && head_block <= high).then_some((head_block, head_pos))
}

/// The `BranchAlways` ending an else arm: sits in the block before the
/// taken arm and jumps forward past it to the reconvergence point.
fn forward_jump_out(
    graph: &InstructionGraph,
    taken_start: usize,
    condition_block: usize,
) -> Option<(usize, usize)> {
    if taken_start == 0 || taken_start - 1 <= condition_block {
        return None;
    }
    let (_, jump) = graph.blocks.get(taken_start - 1)?.branch.as_ref()?;
    if !jump.opcode.is_branch_always() {
        return None;
    }
    let recon_pos = jump.branch_target()?;
    let recon_block = graph.block_at(recon_pos)?;
    (recon_block >= taken_start).then_some((recon_block, recon_pos))
}
