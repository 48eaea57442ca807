//! Pre-decoded instruction listings (JSON or YAML).
//!
//! A listing describes an image without an object file: data segments, symbols,
//! an optional entry point and the classified instruction stream. Bytes are hex
//! strings.

use std::path::Path;

use serde::Deserialize;

use super::decoder::{
    Architecture, DecodeError, DecodeOptions, DecodeOutput, Decoder, ImageLoader, ImageSymbol,
    LoadedImage,
};
use crate::model::{format_address, Address, Instruction, InstructionType, MemorySegment};

#[derive(Debug, Deserialize)]
struct ListingDocument {
    #[serde(default)]
    entry: Option<Address>,
    #[serde(default)]
    symbols: Vec<ImageSymbol>,
    #[serde(default)]
    segments: Vec<ListingSegment>,
    instructions: Vec<ListingInstruction>,
}

#[derive(Debug, Deserialize)]
struct ListingSegment {
    #[serde(default)]
    name: String,
    address: Address,
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct ListingInstruction {
    address: Address,
    bytes: String,
    #[serde(rename = "type", default)]
    kind: InstructionType,
    #[serde(default)]
    targets: Vec<Address>,
    #[serde(default)]
    text: Option<String>,
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}

fn is_listing_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("json" | "yaml" | "yml")
    )
}

pub struct ListingLoader;

impl ImageLoader for ListingLoader {
    fn name(&self) -> &'static str {
        "listing"
    }

    fn accepts(&self, path: &Path, _bytes: &[u8]) -> bool {
        is_listing_path(path)
    }

    fn load(&self, path: &Path, bytes: &[u8]) -> Result<LoadedImage, DecodeError> {
        let malformed =
            |reason: String| DecodeError::Malformed { path: path.to_path_buf(), reason };
        let is_json = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let doc: ListingDocument = if is_json {
            serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?
        } else {
            serde_yaml::from_slice(bytes).map_err(|e| malformed(e.to_string()))?
        };

        let segments = doc
            .segments
            .into_iter()
            .map(|seg| {
                let data = decode_hex(&seg.bytes).ok_or_else(|| {
                    malformed(format!("segment at {} has invalid hex", format_address(seg.address)))
                })?;
                Ok(MemorySegment { name: seg.name, address: seg.address, bytes: data, executable: false })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        let listing = doc
            .instructions
            .into_iter()
            .map(|insn| {
                let data = decode_hex(&insn.bytes).ok_or_else(|| {
                    malformed(format!("instruction at {} has invalid hex", format_address(insn.address)))
                })?;
                let mut out = Instruction::new(insn.address, data, insn.kind).with_targets(insn.targets);
                out.text = insn.text;
                Ok(out)
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        log::debug!(
            "loaded listing {}: {} instructions, {} segments",
            path.display(),
            listing.len(),
            segments.len()
        );
        Ok(LoadedImage {
            path: path.to_path_buf(),
            arch: Architecture::Listing,
            entry: doc.entry,
            segments,
            symbols: doc.symbols,
            listing,
        })
    }
}

/// Replays the loader's instruction list; an empty encoding is a decode fault.
pub struct ListingDecoder;

impl Decoder for ListingDecoder {
    fn name(&self) -> &'static str {
        "listing"
    }

    fn supports(&self, arch: &Architecture) -> bool {
        *arch == Architecture::Listing
    }

    fn decode(&self, image: &LoadedImage, options: &DecodeOptions) -> Result<DecodeOutput, DecodeError> {
        let mut out = DecodeOutput::default();
        let budget = options.max_instructions.unwrap_or(usize::MAX);
        for insn in image.listing.iter().take(budget) {
            if insn.is_empty() {
                out.fault = Some(format!("empty encoding at {}", format_address(insn.address)));
                break;
            }
            out.instructions.push(insn.clone());
        }
        Ok(out)
    }
}
