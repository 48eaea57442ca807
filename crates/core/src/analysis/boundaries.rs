//! Function boundary reconstruction by bounded reachability.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::model::{Address, BlockGraph, BlockId, EntryPoint, Function};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconstructOptions {
    /// Stop the flood fill at blocks that start another entry point.
    pub stop_at_entrypoints: bool,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        Self { stop_at_entrypoints: true }
    }
}

/// Reach of one entry point: `[start, end]` where `end` is the highest block end visited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryPointRange {
    pub name: String,
    pub start: Address,
    pub end: Address,
}

impl EntryPointRange {
    /// Both bounds are inclusive, so a zero-width reach still covers its entry.
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address <= self.end
    }
}

/// Blocks reachable from `entry` without entering another entry point's block.
///
/// The walk uses an explicit stack; the visited set is keyed by block id and
/// checked on insertion so loops and diamonds are visited once.
pub fn reachable_blocks(
    graph: &BlockGraph,
    entry: Address,
    entry_points: &BTreeSet<Address>,
    stop_at_entrypoints: bool,
) -> Vec<BlockId> {
    let Some(first) = graph.block_starting_at(entry) else {
        return Vec::new();
    };
    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![first];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        let successors: Vec<BlockId> = graph.successors(id).collect();
        for succ in successors.into_iter().rev() {
            if visited.contains(&succ) {
                continue;
            }
            let Some(bb) = graph.block(succ) else { continue };
            if stop_at_entrypoints && bb.start != entry && entry_points.contains(&bb.start) {
                log::trace!("reach of {entry:#x} stops at entry point {:#x}", bb.start);
                continue;
            }
            stack.push(succ);
        }
    }
    order
}

/// Functions and per-entry reaches, rebuilt wholesale after every disassembly pass.
#[derive(Debug, Clone, Default)]
pub struct FunctionBoundaries {
    ranges: Vec<EntryPointRange>,
    functions: Vec<Function>,
}

impl FunctionBoundaries {
    pub fn reconstruct(
        graph: &BlockGraph,
        entry_points: &[EntryPoint],
        options: ReconstructOptions,
    ) -> Self {
        let mut unique: Vec<&EntryPoint> = Vec::new();
        for ep in entry_points {
            if !unique.contains(&ep) {
                unique.push(ep);
            }
        }
        let addresses: BTreeSet<Address> = unique.iter().map(|ep| ep.address).collect();

        let mut ranges = Vec::with_capacity(unique.len());
        let mut functions: Vec<Function> = Vec::new();
        for ep in unique {
            let blocks =
                reachable_blocks(graph, ep.address, &addresses, options.stop_at_entrypoints);
            let end = blocks
                .iter()
                .filter_map(|id| graph.block(*id))
                .map(|bb| bb.end)
                .max()
                .unwrap_or(ep.address);
            ranges.push(EntryPointRange { name: ep.name.clone(), start: ep.address, end });

            let function = match functions.iter_mut().position(|f| f.name == ep.name) {
                Some(idx) => &mut functions[idx],
                None => {
                    functions.push(Function::new(ep.name.clone()));
                    let last = functions.len() - 1;
                    &mut functions[last]
                }
            };
            function.entry_points.push(ep.clone());
            for id in blocks {
                if !function.blocks.contains(&id) {
                    function.blocks.push(id);
                }
            }
        }

        log::debug!(
            "reconstructed {} functions from {} entry points",
            functions.len(),
            ranges.len()
        );
        Self { ranges, functions }
    }

    pub fn ranges(&self) -> &[EntryPointRange] {
        &self.ranges
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function_named(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// First range (in entry point order) covering `address`.
    pub fn function_at(&self, address: Address) -> Option<&Function> {
        let range = self.ranges.iter().find(|r| r.contains(address))?;
        self.function_named(&range.name)
    }

    pub fn entrypoint_at(&self, address: Address) -> Option<&EntryPoint> {
        self.functions.iter().flat_map(|f| f.entry_points.iter()).find(|ep| ep.address == address)
    }
}
