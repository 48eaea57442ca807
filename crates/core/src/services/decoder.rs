//! Loader and decoder collaborator interfaces.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::ImageMemory;
use crate::model::{Address, Instruction, MemorySegment};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unrecognized image format: {0}")]
    UnrecognizedFormat(PathBuf),

    #[error("Malformed image {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Decoder initialisation failed: {0}")]
    Backend(String),
}

/// Machine type of a loaded image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86,
    X86_64,
    Arm,
    Thumb,
    Arm64,
    RiscV32,
    RiscV64,
    /// Pre-decoded instruction listing.
    Listing,
    Unsupported(String),
}

impl Architecture {
    pub fn as_str(&self) -> &str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm => "arm",
            Architecture::Thumb => "thumb",
            Architecture::Arm64 => "arm64",
            Architecture::RiscV32 => "riscv32",
            Architecture::RiscV64 => "riscv64",
            Architecture::Listing => "listing",
            Architecture::Unsupported(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "x86" | "i386" => Architecture::X86,
            "x86_64" | "amd64" => Architecture::X86_64,
            "arm" | "armv7" => Architecture::Arm,
            "thumb" => Architecture::Thumb,
            "arm64" | "aarch64" => Architecture::Arm64,
            "riscv32" => Architecture::RiscV32,
            "riscv64" | "riscv" => Architecture::RiscV64,
            "listing" => Architecture::Listing,
            other => Architecture::Unsupported(other.to_string()),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Function symbol exported by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSymbol {
    pub name: String,
    pub address: Address,
}

/// An image as produced by a loader: memory, metadata and (for listings) instructions.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub path: PathBuf,
    pub arch: Architecture,
    pub entry: Option<Address>,
    pub segments: Vec<MemorySegment>,
    pub symbols: Vec<ImageSymbol>,
    /// Instructions already decoded by the loader (listing images only).
    pub listing: Vec<Instruction>,
}

impl LoadedImage {
    pub fn executable_segments(&self) -> impl Iterator<Item = &MemorySegment> {
        self.segments.iter().filter(|seg| seg.executable)
    }
}

impl ImageMemory for LoadedImage {
    fn read(&self, address: Address, len: usize) -> Option<Vec<u8>> {
        self.segments.as_slice().read(address, len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeOptions {
    pub max_instructions: Option<usize>,
}

/// Decoder output; `fault` is set when the pass stopped early.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    pub instructions: Vec<Instruction>,
    pub fault: Option<String>,
    /// Bytes stepped over because they did not decode.
    pub skipped_bytes: usize,
}

/// Turns a file into a [`LoadedImage`].
pub trait ImageLoader: Send + Sync {
    fn name(&self) -> &'static str;
    fn accepts(&self, path: &Path, bytes: &[u8]) -> bool;
    fn load(&self, path: &Path, bytes: &[u8]) -> Result<LoadedImage, DecodeError>;
}

/// Decodes the executable memory of an image into classified instructions.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, arch: &Architecture) -> bool;
    fn decode(&self, image: &LoadedImage, options: &DecodeOptions) -> Result<DecodeOutput, DecodeError>;
}
