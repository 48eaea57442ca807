//! Pluggable state update functions and their registry.

use std::collections::BTreeMap;

use super::state::{StateError, StateValue};
use crate::model::Instruction;

/// Pure mapping from (current state, instruction) to the next state.
///
/// `prepare` runs once before a calculation pass and may allocate lookup
/// tables; `cleanup` releases them again.
pub trait StateUpdateFunction: Send {
    fn name(&self) -> &'static str;

    fn prepare(&mut self) -> Result<(), StateError> {
        Ok(())
    }

    fn update(&self, state: &StateValue, insn: &Instruction) -> Result<StateValue, StateError>;

    fn cleanup(&mut self) {}
}

/// Running XOR of every instruction byte into byte 0 of the state.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorUpdate;

impl StateUpdateFunction for XorUpdate {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn update(&self, state: &StateValue, insn: &Instruction) -> Result<StateValue, StateError> {
        let mut bytes = state.bytes().to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }
        bytes[0] = insn.bytes.iter().fold(bytes[0], |acc, b| acc ^ b);
        Ok(StateValue::from_bytes(bytes))
    }
}

/// Wrapping 32-bit sum of the instruction's little-endian words.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumUpdate;

impl StateUpdateFunction for SumUpdate {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn update(&self, state: &StateValue, insn: &Instruction) -> Result<StateValue, StateError> {
        let mut acc = state.to_u64() as u32;
        for chunk in insn.bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            acc = acc.wrapping_add(u32::from_le_bytes(word));
        }
        Ok(StateValue::from_u64(acc as u64, state.width().max(4)))
    }
}

/// CRC-32C (Castagnoli), reflected, without implicit pre/post inversion.
///
/// The seed supplies the initial register; analysts seed `0xffffffff` for the
/// standard check value.
#[derive(Debug, Default, Clone)]
pub struct Crc32cUpdate {
    pub table: Option<Box<[u32; 256]>>,
}

const CRC32C_POLY: u32 = 0x82F6_3B78;

impl Crc32cUpdate {
    fn build_table() -> Box<[u32; 256]> {
        let mut table = Box::new([0u32; 256]);
        for (idx, slot) in table.iter_mut().enumerate() {
            let mut crc = idx as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ CRC32C_POLY } else { crc >> 1 };
            }
            *slot = crc;
        }
        table
    }
}

impl StateUpdateFunction for Crc32cUpdate {
    fn name(&self) -> &'static str {
        "crc32c"
    }

    fn prepare(&mut self) -> Result<(), StateError> {
        if self.table.is_none() {
            self.table = Some(Self::build_table());
        }
        Ok(())
    }

    fn update(&self, state: &StateValue, insn: &Instruction) -> Result<StateValue, StateError> {
        let table = self.table.as_ref().ok_or(StateError::NotPrepared)?;
        let mut crc = state.to_u64() as u32;
        for byte in &insn.bytes {
            crc = table[((crc ^ *byte as u32) & 0xff) as usize] ^ (crc >> 8);
        }
        Ok(StateValue::from_u64(crc as u64, state.width().max(4)))
    }

    fn cleanup(&mut self) {
        self.table = None;
    }
}

type UpdateFactory = fn() -> Box<dyn StateUpdateFunction>;

/// Registry of update functions; callers select by name.
#[derive(Default)]
pub struct UpdateFunctionRegistry {
    factories: BTreeMap<String, UpdateFactory>,
    arch_defaults: BTreeMap<String, String>,
}

impl UpdateFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: UpdateFactory) -> &mut Self {
        self.factories.insert(name.to_string(), factory);
        self
    }

    /// Map an architecture name to the update function used when none is configured.
    pub fn set_default_for_arch(&mut self, arch: &str, name: &str) -> &mut Self {
        self.arch_defaults.insert(arch.to_string(), name.to_string());
        self
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn StateUpdateFunction>, StateError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| StateError::UnknownUpdateFunction(name.to_string()))
    }

    pub fn default_for_arch(&self, arch: &str) -> Option<&str> {
        self.arch_defaults.get(arch).map(String::as_str)
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

fn xor() -> Box<dyn StateUpdateFunction> {
    Box::new(XorUpdate)
}

fn sum() -> Box<dyn StateUpdateFunction> {
    Box::new(SumUpdate)
}

fn crc32c() -> Box<dyn StateUpdateFunction> {
    Box::new(Crc32cUpdate::default())
}

/// Registry populated with the built-in update functions.
pub fn default_update_registry() -> UpdateFunctionRegistry {
    let mut registry = UpdateFunctionRegistry::new();
    registry.register("xor", xor).register("sum", sum).register("crc32c", crc32c);
    for arch in ["x86", "x86_64", "arm", "thumb", "arm64"] {
        registry.set_default_for_arch(arch, "crc32c");
    }
    for arch in ["riscv32", "riscv64"] {
        registry.set_default_for_arch(arch, "sum");
    }
    registry.set_default_for_arch("listing", "xor");
    registry
}
