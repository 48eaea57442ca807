//! Core data model (IR) for decoded images.
//!
//! This module contains:
//! - Instruction representation and the closed control-flow classification
//! - Basic block and edge structures (see [`graph`] for the arena that owns them)
//! - Functions and their entry points
//! - Raw memory segments of a loaded image

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod graph;

pub use graph::BlockGraph;

/// Architecture word-sized address.
pub type Address = u64;

/// Render an address the way it is shown to analysts (`0x%08x`).
pub fn format_address(address: Address) -> String {
    format!("0x{address:08x}")
}

/// Parse an address typed by a user: `0x`-prefixed hex, otherwise decimal.
pub fn parse_address(text: &str) -> Option<Address> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Address::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse().ok()
    }
}

/// Control-flow classification of a single instruction.
///
/// Serialized in the dotted form used by annotations (`call.direct`, ...);
/// unrecognized strings deserialize as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum InstructionType {
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "sequential")]
    Sequential,
    #[serde(rename = "call.direct")]
    DirectCall,
    #[serde(rename = "call.indirect")]
    IndirectCall,
    #[serde(rename = "return")]
    Return,
    #[serde(rename = "trap")]
    Trap,
    #[serde(rename = "branch.direct")]
    DirectBranch,
    #[serde(rename = "branch.indirect")]
    IndirectBranch,
    #[serde(rename = "branch.conditional")]
    ConditionalBranch,
}

impl From<String> for InstructionType {
    fn from(text: String) -> Self {
        InstructionType::from_annotation_str(&text)
    }
}

impl InstructionType {
    pub const ALL: [InstructionType; 9] = [
        InstructionType::Unknown,
        InstructionType::Sequential,
        InstructionType::DirectCall,
        InstructionType::IndirectCall,
        InstructionType::Return,
        InstructionType::Trap,
        InstructionType::DirectBranch,
        InstructionType::IndirectBranch,
        InstructionType::ConditionalBranch,
    ];

    /// Dotted form used in annotation payloads.
    pub fn as_annotation_str(self) -> &'static str {
        match self {
            InstructionType::Unknown => "unknown",
            InstructionType::Sequential => "sequential",
            InstructionType::DirectCall => "call.direct",
            InstructionType::IndirectCall => "call.indirect",
            InstructionType::Return => "return",
            InstructionType::Trap => "trap",
            InstructionType::DirectBranch => "branch.direct",
            InstructionType::IndirectBranch => "branch.indirect",
            InstructionType::ConditionalBranch => "branch.conditional",
        }
    }

    /// Parse the dotted form; anything unrecognized is `Unknown`.
    pub fn from_annotation_str(text: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_annotation_str() == text)
            .unwrap_or(InstructionType::Unknown)
    }

    /// Upper-case name used in listings and reports.
    pub fn display_name(self) -> &'static str {
        match self {
            InstructionType::Unknown => "UNKNOWN",
            InstructionType::Sequential => "SEQUENTIAL",
            InstructionType::DirectCall => "DIRECT_CALL",
            InstructionType::IndirectCall => "INDIRECT_CALL",
            InstructionType::Return => "RETURN",
            InstructionType::Trap => "TRAP",
            InstructionType::DirectBranch => "DIRECT_BRANCH",
            InstructionType::IndirectBranch => "INDIRECT_BRANCH",
            InstructionType::ConditionalBranch => "CONDITIONAL_BRANCH",
        }
    }

    pub fn from_display_name(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.display_name() == text)
    }

    /// Whether an instruction of this type ends its basic block.
    pub fn is_terminator(self) -> bool {
        !matches!(self, InstructionType::Sequential | InstructionType::Unknown)
    }

    /// Whether execution may continue at the next instruction.
    pub fn falls_through(self) -> bool {
        matches!(
            self,
            InstructionType::Sequential
                | InstructionType::Unknown
                | InstructionType::DirectCall
                | InstructionType::IndirectCall
                | InstructionType::ConditionalBranch
        )
    }

    /// Edge kind used for the instruction's explicit targets, if it has any.
    pub fn target_edge_kind(self) -> Option<EdgeKind> {
        match self {
            InstructionType::DirectCall => Some(EdgeKind::Call),
            InstructionType::IndirectCall => Some(EdgeKind::IndirectCall),
            InstructionType::DirectBranch => Some(EdgeKind::Jump),
            InstructionType::ConditionalBranch => Some(EdgeKind::ConditionalJump),
            InstructionType::IndirectBranch => Some(EdgeKind::IndirectJump),
            InstructionType::Unknown
            | InstructionType::Sequential
            | InstructionType::Return
            | InstructionType::Trap => None,
        }
    }
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One decoded instruction. Immutable once produced by a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: Address,
    /// Raw encoding; its length is the instruction length.
    pub bytes: Vec<u8>,
    pub kind: InstructionType,
    /// Statically known branch/call targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Address>,
    /// Architecture-specific rendering (mnemonic and operands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Instruction {
    pub fn new(address: Address, bytes: impl Into<Vec<u8>>, kind: InstructionType) -> Self {
        Self { address, bytes: bytes.into(), kind, targets: Vec::new(), text: None }
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = Address>) -> Self {
        self.targets = targets.into_iter().collect();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First address after this instruction.
    pub fn end(&self) -> Address {
        self.address.saturating_add(self.len())
    }
}

/// Kind of control-flow edge for a basic block successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Fallthrough,
    Jump,
    ConditionalJump,
    IndirectJump,
    Call,
    IndirectCall,
}

/// Index of a block inside its owning [`BlockGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

/// Successor edge with target and edge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEdge {
    pub target: BlockId,
    pub kind: EdgeKind,
}

/// Contiguous run of instructions with one entry and one exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub start: Address,
    /// Address of the last instruction plus its length.
    pub end: Address,
    /// Index range into the graph's instruction arena.
    pub instructions: std::ops::Range<usize>,
    /// Classification of the terminating instruction.
    pub terminator: InstructionType,
    pub successors: Vec<BlockEdge>,
}

impl BasicBlock {
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }
}

/// Named address known to start a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: Address,
    pub name: String,
}

impl EntryPoint {
    pub fn new(address: Address, name: impl Into<String>) -> Self {
        Self { address, name: name.into() }
    }
}

/// A named collection of blocks reachable from one or more entry points.
///
/// Start and end are always derived from the member blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    pub name: String,
    pub entry_points: Vec<EntryPoint>,
    pub blocks: Vec<BlockId>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entry_points: Vec::new(), blocks: Vec::new() }
    }

    pub fn is_entry_point(&self, address: Address) -> bool {
        self.entry_points.iter().any(|ep| ep.address == address)
    }

    /// Lowest start address over member blocks.
    pub fn start_address(&self, graph: &BlockGraph) -> Option<Address> {
        self.blocks.iter().filter_map(|id| graph.block(*id)).map(|bb| bb.start).min()
    }

    /// Highest end address over member blocks.
    pub fn end_address(&self, graph: &BlockGraph) -> Option<Address> {
        self.blocks.iter().filter_map(|id| graph.block(*id)).map(|bb| bb.end).max()
    }
}

/// Raw bytes mapped at a virtual address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySegment {
    pub name: String,
    pub address: Address,
    pub bytes: Vec<u8>,
    pub executable: bool,
}

impl MemorySegment {
    pub fn end(&self) -> Address {
        self.address.saturating_add(self.bytes.len() as u64)
    }

    /// Read `len` bytes at `address` if they are fully inside this segment.
    pub fn read(&self, address: Address, len: usize) -> Option<&[u8]> {
        if address < self.address {
            return None;
        }
        let offset = usize::try_from(address - self.address).ok()?;
        let end = offset.checked_add(len)?;
        self.bytes.get(offset..end)
    }
}
