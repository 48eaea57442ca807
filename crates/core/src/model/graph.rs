//! Arena of basic blocks built from a decoded instruction stream.
//!
//! Blocks reference each other by [`BlockId`] only; the graph owns every block
//! and instruction. Classification overrides are applied before leaders are
//! computed, so a changed override requires a rebuild rather than a patch.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    Address, BasicBlock, BlockEdge, BlockId, EdgeKind, Instruction, InstructionType,
};

#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    instructions: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    by_start: BTreeMap<Address, BlockId>,
    by_address: BTreeMap<Address, usize>,
    block_of_instruction: Vec<BlockId>,
    unresolved_targets: Vec<(Address, Address)>,
}

impl BlockGraph {
    /// Build the graph from a decoded instruction stream.
    ///
    /// `overrides` replaces the decoder's classification per address and
    /// `extra_leaders` forces block boundaries (entry points, state seeds).
    pub fn build(
        mut instructions: Vec<Instruction>,
        overrides: &BTreeMap<Address, InstructionType>,
        extra_leaders: &BTreeSet<Address>,
    ) -> Self {
        instructions.sort_by_key(|insn| insn.address);
        instructions.retain(|insn| !insn.is_empty());
        instructions.dedup_by_key(|insn| insn.address);
        for insn in instructions.iter_mut() {
            if let Some(kind) = overrides.get(&insn.address) {
                insn.kind = *kind;
            }
        }

        let by_address: BTreeMap<Address, usize> =
            instructions.iter().enumerate().map(|(idx, insn)| (insn.address, idx)).collect();

        let leaders = compute_leaders(&instructions, &by_address, extra_leaders);

        let mut graph = BlockGraph {
            block_of_instruction: Vec::with_capacity(instructions.len()),
            instructions,
            by_address,
            ..Default::default()
        };
        graph.cut_blocks(&leaders);
        graph.link_blocks();

        log::debug!(
            "built block graph: {} instructions, {} blocks, {} unresolved targets",
            graph.instructions.len(),
            graph.blocks.len(),
            graph.unresolved_targets.len()
        );
        graph
    }

    fn cut_blocks(&mut self, leaders: &BTreeSet<Address>) {
        let mut start_idx = 0usize;
        for idx in 0..self.instructions.len() {
            let insn = &self.instructions[idx];
            let next = self.instructions.get(idx + 1);
            let ends_here = insn.kind.is_terminator()
                || match next {
                    Some(next) => next.address != insn.end() || leaders.contains(&next.address),
                    None => true,
                };
            if !ends_here {
                continue;
            }

            let id = BlockId(self.blocks.len());
            let first = &self.instructions[start_idx];
            self.blocks.push(BasicBlock {
                id,
                start: first.address,
                end: insn.end(),
                instructions: start_idx..idx + 1,
                terminator: insn.kind,
                successors: Vec::new(),
            });
            self.by_start.insert(first.address, id);
            self.block_of_instruction.extend(std::iter::repeat(id).take(idx + 1 - start_idx));
            start_idx = idx + 1;
        }
    }

    fn link_blocks(&mut self) {
        for block_idx in 0..self.blocks.len() {
            let last_idx = self.blocks[block_idx].instructions.end - 1;
            let last = &self.instructions[last_idx];
            let mut successors: Vec<BlockEdge> = Vec::new();

            if let Some(edge_kind) = last.kind.target_edge_kind() {
                for target in &last.targets {
                    match self.by_start.get(target) {
                        Some(id) => push_unique(&mut successors, BlockEdge { target: *id, kind: edge_kind }),
                        None => self.unresolved_targets.push((last.address, *target)),
                    }
                }
            }

            if last.kind.falls_through() {
                if let Some(id) = self.by_start.get(&last.end()) {
                    push_unique(&mut successors, BlockEdge { target: *id, kind: EdgeKind::Fallthrough });
                }
            }

            self.blocks[block_idx].successors = successors;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Successor blocks of `id` in edge order.
    pub fn successors(&self, id: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.block(id).into_iter().flat_map(|bb| bb.successors.iter().map(|edge| edge.target))
    }

    pub fn block_starting_at(&self, address: Address) -> Option<BlockId> {
        self.by_start.get(&address).copied()
    }

    /// Block holding the instruction that starts at `address`.
    pub fn block_containing(&self, address: Address) -> Option<BlockId> {
        self.by_address.get(&address).map(|idx| self.block_of_instruction[*idx])
    }

    pub fn instruction_at(&self, address: Address) -> Option<&Instruction> {
        self.by_address.get(&address).map(|idx| &self.instructions[*idx])
    }

    pub fn instructions_of(&self, id: BlockId) -> &[Instruction] {
        match self.block(id) {
            Some(bb) => &self.instructions[bb.instructions.clone()],
            None => &[],
        }
    }

    /// (source instruction, target) pairs whose target is not a decoded block start.
    pub fn unresolved_targets(&self) -> &[(Address, Address)] {
        &self.unresolved_targets
    }
}

fn push_unique(edges: &mut Vec<BlockEdge>, edge: BlockEdge) {
    if !edges.contains(&edge) {
        edges.push(edge);
    }
}

fn compute_leaders(
    instructions: &[Instruction],
    by_address: &BTreeMap<Address, usize>,
    extra_leaders: &BTreeSet<Address>,
) -> BTreeSet<Address> {
    let mut leaders = BTreeSet::new();
    if let Some(first) = instructions.first() {
        leaders.insert(first.address);
    }
    leaders.extend(extra_leaders.iter().filter(|addr| by_address.contains_key(addr)).copied());

    for (idx, insn) in instructions.iter().enumerate() {
        if insn.kind.target_edge_kind().is_some() {
            leaders.extend(insn.targets.iter().filter(|t| by_address.contains_key(t)).copied());
        }
        if let Some(next) = instructions.get(idx + 1) {
            if insn.kind.is_terminator() || next.address != insn.end() {
                leaders.insert(next.address);
            }
        }
    }
    leaders
}
