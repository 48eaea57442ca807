//! Forward propagation of a domain-specific state value over the block graph.
//!
//! Each seed starts an independent depth-first walk. The first value computed
//! for an address is authoritative; later arrivals carrying a different value
//! are recorded as [`StateFixup`]s and that path stops there. Load-reference
//! annotations compare (or inject) constants read from image memory.
//!
//! A pass computes into fresh tables and only replaces the previous ones when
//! it finishes successfully.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::update::StateUpdateFunction;
use crate::annotations::{AnnotationStore, UpdateType};
use crate::model::{format_address, Address, BlockGraph, BlockId, MemorySegment};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State calculator used before prepare()")]
    NotPrepared,

    #[error("State update function could not be prepared: {0}")]
    Preparation(String),

    #[error("State update failed at {address:#010x}: {reason}")]
    UpdateFailed { address: Address, reason: String },

    #[error("Load reference at {address:#010x} has no data operand address")]
    MissingReference { address: Address },

    #[error("State calculation cancelled")]
    Cancelled,

    #[error("Unknown state update function '{0}'")]
    UnknownUpdateFunction(String),

    #[error("Invalid state value '{0}'")]
    InvalidValue(String),
}

/// Opaque state value stored little-endian with a fixed width in bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StateValue(Vec<u8>);

impl StateValue {
    pub fn zero(width: usize) -> Self {
        Self(vec![0; width])
    }

    /// Little-endian encoding of `value` truncated or zero-extended to `width` bytes.
    pub fn from_u64(value: u64, width: usize) -> Self {
        let mut bytes = value.to_le_bytes().to_vec();
        bytes.resize(width, 0);
        Self(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Low 64 bits as an integer.
    pub fn to_u64(&self) -> u64 {
        let mut word = [0u8; 8];
        let n = self.0.len().min(8);
        word[..n].copy_from_slice(&self.0[..n]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0.iter().rev() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateValue({self})")
    }
}

impl FromStr for StateValue {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StateError::InvalidValue(s.to_string());
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let padded = if digits.len() % 2 == 1 { format!("0{digits}") } else { digits.to_string() };
        let mut bytes = padded
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|text| u8::from_str_radix(text, 16).ok())
                    .ok_or_else(invalid)
            })
            .collect::<Result<Vec<u8>, _>>()?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl From<StateValue> for String {
    fn from(value: StateValue) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for StateValue {
    type Error = StateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupKind {
    /// Two propagation paths reached the same address with different states.
    MergeConflict,
    /// A load reference expected a different pre/post state.
    ReferenceMismatch,
    /// A load reference operand could not be resolved in image memory.
    MissingReference,
    /// A constant injection replaced the computed post-state.
    Injection,
}

impl FixupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FixupKind::MergeConflict => "merge_conflict",
            FixupKind::ReferenceMismatch => "reference_mismatch",
            FixupKind::MissingReference => "missing_reference",
            FixupKind::Injection => "injection",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        [
            FixupKind::MergeConflict,
            FixupKind::ReferenceMismatch,
            FixupKind::MissingReference,
            FixupKind::Injection,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupResolution {
    AcceptComputed,
    AcceptExpected,
    Unresolved,
}

impl FixupResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            FixupResolution::AcceptComputed => "accept_computed",
            FixupResolution::AcceptExpected => "accept_expected",
            FixupResolution::Unresolved => "unresolved",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "accept_computed" => Some(FixupResolution::AcceptComputed),
            "accept_expected" => Some(FixupResolution::AcceptExpected),
            "unresolved" => Some(FixupResolution::Unresolved),
            _ => None,
        }
    }
}

/// Disagreement between a propagated value and an independently known one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFixup {
    pub address: Address,
    pub kind: FixupKind,
    /// Value the first writer or the annotation expects; absent when unreadable.
    pub expected: Option<StateValue>,
    pub computed: StateValue,
    pub resolution: FixupResolution,
}

impl StateFixup {
    /// Resolve the fixup; resolution is always the caller's decision.
    pub fn resolve(&mut self, resolution: FixupResolution) {
        self.resolution = resolution;
    }
}

/// Read access to the bytes of a loaded image.
pub trait ImageMemory {
    fn read(&self, address: Address, len: usize) -> Option<Vec<u8>>;
}

impl ImageMemory for [MemorySegment] {
    fn read(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        self.iter().find_map(|seg| seg.read(address, len)).map(<[u8]>::to_vec)
    }
}

impl ImageMemory for Vec<MemorySegment> {
    fn read(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        self.as_slice().read(address, len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalculationOptions {
    /// Do not enter blocks that start at another entry point.
    pub stop_at_entrypoints: bool,
}

/// Everything a calculation pass reads.
pub struct PropagationInput<'a> {
    pub graph: &'a BlockGraph,
    pub annotations: &'a AnnotationStore,
    pub memory: &'a dyn ImageMemory,
    /// Entry point addresses, consulted when `stop_at_entrypoints` is set.
    pub entry_points: &'a BTreeSet<Address>,
}

/// Per-address pre/post state tables for one update function.
pub struct StateCalculator {
    update: Box<dyn StateUpdateFunction>,
    options: CalculationOptions,
    seeds: Vec<(Address, StateValue)>,
    prepared: bool,
    pre: BTreeMap<Address, StateValue>,
    post: BTreeMap<Address, StateValue>,
}

struct Pass {
    pre: BTreeMap<Address, StateValue>,
    post: BTreeMap<Address, StateValue>,
    fixups: Vec<StateFixup>,
    /// Addresses that already carry a merge conflict fixup.
    conflicts: HashSet<Address>,
}

impl Pass {
    fn conflict(&mut self, address: Address, first: &StateValue, arriving: &StateValue) {
        if self.conflicts.insert(address) {
            log::trace!(
                "merge conflict at {}: {} vs {}",
                format_address(address),
                first,
                arriving
            );
            self.fixups.push(StateFixup {
                address,
                kind: FixupKind::MergeConflict,
                expected: Some(first.clone()),
                computed: arriving.clone(),
                resolution: FixupResolution::Unresolved,
            });
        }
    }
}

impl StateCalculator {
    pub fn new(update: Box<dyn StateUpdateFunction>) -> Self {
        Self {
            update,
            options: CalculationOptions::default(),
            seeds: Vec::new(),
            prepared: false,
            pre: BTreeMap::new(),
            post: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: CalculationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn update_function_name(&self) -> &'static str {
        self.update.name()
    }

    /// Register the initial state at a root address; re-seeding an address replaces it.
    pub fn define_pre_state(&mut self, address: Address, seed: StateValue) {
        match self.seeds.iter_mut().find(|(addr, _)| *addr == address) {
            Some(entry) => entry.1 = seed,
            None => self.seeds.push((address, seed)),
        }
    }

    pub fn seeds(&self) -> &[(Address, StateValue)] {
        &self.seeds
    }

    pub fn prepare(&mut self) -> Result<(), StateError> {
        self.update.prepare()?;
        self.prepared = true;
        Ok(())
    }

    pub fn calculate(&mut self, input: &PropagationInput<'_>) -> Result<Vec<StateFixup>, StateError> {
        self.calculate_with(input, &mut || false)
    }

    /// Run a full pass; `cancelled` is polled once per visited block.
    pub fn calculate_with(
        &mut self,
        input: &PropagationInput<'_>,
        cancelled: &mut dyn FnMut() -> bool,
    ) -> Result<Vec<StateFixup>, StateError> {
        if !self.prepared {
            return Err(StateError::NotPrepared);
        }
        let mut pass = Pass {
            pre: BTreeMap::new(),
            post: BTreeMap::new(),
            fixups: Vec::new(),
            conflicts: HashSet::new(),
        };

        for (seed_addr, seed) in &self.seeds {
            let Some(first_block) = input.graph.block_containing(*seed_addr) else {
                log::warn!("seed {} is not a decoded instruction", format_address(*seed_addr));
                continue;
            };
            let mut worklist: Vec<(BlockId, Address, StateValue)> =
                vec![(first_block, *seed_addr, seed.clone())];

            while let Some((block, arrival, state)) = worklist.pop() {
                if cancelled() {
                    return Err(StateError::Cancelled);
                }
                let Some(exit_state) = self.walk_block(input, &mut pass, block, arrival, state)?
                else {
                    continue;
                };
                let successors: Vec<BlockId> = input.graph.successors(block).collect();
                for succ in successors.into_iter().rev() {
                    let Some(bb) = input.graph.block(succ) else { continue };
                    if self.options.stop_at_entrypoints
                        && bb.start != *seed_addr
                        && input.entry_points.contains(&bb.start)
                    {
                        continue;
                    }
                    worklist.push((succ, bb.start, exit_state.clone()));
                }
            }
        }

        log::debug!(
            "state pass with '{}': {} addresses, {} fixups",
            self.update.name(),
            pass.post.len(),
            pass.fixups.len()
        );
        self.pre = pass.pre;
        self.post = pass.post;
        Ok(pass.fixups)
    }

    /// Walk one block from `arrival`; returns the exit state unless the path stopped.
    fn walk_block(
        &self,
        input: &PropagationInput<'_>,
        pass: &mut Pass,
        block: BlockId,
        arrival: Address,
        mut state: StateValue,
    ) -> Result<Option<StateValue>, StateError> {
        let insns = input.graph.instructions_of(block);
        let start = insns.iter().position(|insn| insn.address == arrival).unwrap_or(0);

        for insn in &insns[start..] {
            if let Some(first) = pass.pre.get(&insn.address) {
                if *first != state {
                    let first = first.clone();
                    pass.conflict(insn.address, &first, &state);
                }
                return Ok(None);
            }
            pass.pre.insert(insn.address, state.clone());

            let mut post = self.update.update(&state, insn)?;
            if let Some(reference) = input.annotations.load_reference_at(insn.address) {
                let data_addr = reference
                    .data_load
                    .ok_or(StateError::MissingReference { address: insn.address })?;
                match input.memory.read(data_addr, state.width()) {
                    None => {
                        log::warn!(
                            "load reference at {} points at unmapped {}",
                            format_address(insn.address),
                            format_address(data_addr)
                        );
                        pass.fixups.push(StateFixup {
                            address: insn.address,
                            kind: FixupKind::MissingReference,
                            expected: None,
                            computed: post.clone(),
                            resolution: FixupResolution::Unresolved,
                        });
                    }
                    Some(bytes) => {
                        let expected = StateValue::from_bytes(bytes);
                        let (computed, kind, resolution) = match reference.update_type {
                            UpdateType::SignatureLoad => {
                                (&state, FixupKind::ReferenceMismatch, FixupResolution::Unresolved)
                            }
                            UpdateType::ConstantLoad => {
                                (&post, FixupKind::ReferenceMismatch, FixupResolution::Unresolved)
                            }
                            UpdateType::ConstInjection => {
                                (&post, FixupKind::Injection, FixupResolution::AcceptExpected)
                            }
                        };
                        if *computed != expected {
                            pass.fixups.push(StateFixup {
                                address: insn.address,
                                kind,
                                expected: Some(expected.clone()),
                                computed: computed.clone(),
                                resolution,
                            });
                        }
                        if reference.update_type == UpdateType::ConstInjection {
                            post = expected;
                        }
                    }
                }
            }

            pass.post.insert(insn.address, post.clone());
            state = post;
        }
        Ok(Some(state))
    }

    /// Release the update function's intermediate caches; tables are kept.
    pub fn cleanup_state(&mut self) {
        self.update.cleanup();
        self.prepared = false;
    }

    pub fn pre_states(&self) -> &BTreeMap<Address, StateValue> {
        &self.pre
    }

    pub fn post_states(&self) -> &BTreeMap<Address, StateValue> {
        &self.post
    }

    pub fn states_at(&self, address: Address) -> (Option<&StateValue>, Option<&StateValue>) {
        (self.pre.get(&address), self.post.get(&address))
    }
}
