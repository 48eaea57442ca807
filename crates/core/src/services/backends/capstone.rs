use std::path::Path;

use capstone::{arch, prelude::*, Capstone, Insn, InsnDetail, InsnGroupId};
use goblin::{elf, mach, pe, Object};

use crate::model::{format_address, Address, Instruction, InstructionType, MemorySegment};
use crate::services::decoder::{
    Architecture, DecodeError, DecodeOptions, DecodeOutput, Decoder, ImageLoader, ImageSymbol,
    LoadedImage,
};

/// ELF, PE and Mach-O loader backed by goblin.
pub struct GoblinLoader;

/// Linear-sweep decoder backed by capstone.
pub struct CapstoneDecoder;

fn capstone_version() -> String {
    let (major, minor) = Capstone::lib_version();
    format!("{major}.{minor}")
}

fn elf_arch(elf: &elf::Elf) -> Architecture {
    match elf.header.e_machine {
        elf::header::EM_X86_64 => Architecture::X86_64,
        elf::header::EM_386 => Architecture::X86,
        elf::header::EM_AARCH64 => Architecture::Arm64,
        elf::header::EM_ARM if elf.entry & 1 == 1 => Architecture::Thumb,
        elf::header::EM_ARM => Architecture::Arm,
        elf::header::EM_RISCV if elf.is_64 => Architecture::RiscV64,
        elf::header::EM_RISCV => Architecture::RiscV32,
        other => Architecture::Unsupported(format!("elf-machine-{other}")),
    }
}

fn pe_arch(pe: &pe::PE) -> Architecture {
    match pe.header.coff_header.machine {
        pe::header::COFF_MACHINE_X86 => Architecture::X86,
        pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
        pe::header::COFF_MACHINE_ARM => Architecture::Arm,
        pe::header::COFF_MACHINE_ARMNT => Architecture::Thumb,
        pe::header::COFF_MACHINE_ARM64 => Architecture::Arm64,
        other => Architecture::Unsupported(format!("coff-machine-{other:#x}")),
    }
}

fn mach_arch(bin: &mach::MachO) -> Architecture {
    match bin.header.cputype() {
        mach::cputype::CPU_TYPE_X86 => Architecture::X86,
        mach::cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
        mach::cputype::CPU_TYPE_ARM => Architecture::Arm,
        mach::cputype::CPU_TYPE_ARM64 => Architecture::Arm64,
        other => Architecture::Unsupported(format!("mach-cputype-{other}")),
    }
}

/// Thumb code addresses carry the interworking bit; strip it.
fn code_address(arch: &Architecture, address: Address) -> Address {
    if *arch == Architecture::Thumb {
        address & !1
    } else {
        address
    }
}

fn file_slice(bytes: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    bytes.get(start..end)
}

fn load_elf(path: &Path, bytes: &[u8], elf: &elf::Elf) -> LoadedImage {
    let arch = elf_arch(elf);
    let mut segments = Vec::new();
    for sh in &elf.section_headers {
        let alloc = sh.sh_flags & u64::from(elf::section_header::SHF_ALLOC) != 0;
        if !alloc || sh.sh_type != elf::section_header::SHT_PROGBITS || sh.sh_size == 0 {
            continue;
        }
        let Some(data) = file_slice(bytes, sh.sh_offset, sh.sh_size) else {
            log::warn!("section at {} lies outside the file", format_address(sh.sh_addr));
            continue;
        };
        segments.push(MemorySegment {
            name: elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string(),
            address: sh.sh_addr,
            bytes: data.to_vec(),
            executable: sh.sh_flags & u64::from(elf::section_header::SHF_EXECINSTR) != 0,
        });
    }

    let mut symbols = Vec::new();
    for sym in &elf.syms {
        if !sym.is_function() || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
            continue;
        }
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        symbols.push(ImageSymbol {
            name: name.to_string(),
            address: code_address(&arch, sym.st_value),
        });
    }

    let entry = (elf.entry != 0).then(|| code_address(&arch, elf.entry));
    LoadedImage { path: path.to_path_buf(), arch, entry, segments, symbols, listing: Vec::new() }
}

fn load_pe(path: &Path, bytes: &[u8], pe: &pe::PE) -> LoadedImage {
    let arch = pe_arch(pe);
    let base = pe.image_base as u64;
    let mut segments = Vec::new();
    for sec in &pe.sections {
        let Some(data) =
            file_slice(bytes, sec.pointer_to_raw_data as u64, sec.size_of_raw_data as u64)
        else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        segments.push(MemorySegment {
            name: sec.name().unwrap_or_default().to_string(),
            address: base + sec.virtual_address as u64,
            bytes: data.to_vec(),
            executable: sec.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0,
        });
    }

    let symbols = pe
        .exports
        .iter()
        .filter(|exp| exp.rva != 0)
        .filter_map(|exp| {
            let name = exp.name?;
            Some(ImageSymbol {
                name: name.to_string(),
                address: code_address(&arch, base + exp.rva as u64),
            })
        })
        .collect();

    let entry = (pe.entry != 0).then(|| code_address(&arch, base + pe.entry as u64));
    LoadedImage { path: path.to_path_buf(), arch, entry, segments, symbols, listing: Vec::new() }
}

fn load_mach(path: &Path, bin: &mach::MachO) -> LoadedImage {
    let arch = mach_arch(bin);
    let exec_flags =
        mach::constants::S_ATTR_PURE_INSTRUCTIONS | mach::constants::S_ATTR_SOME_INSTRUCTIONS;
    let segments = bin
        .segments
        .sections()
        .flatten()
        .filter_map(Result::ok)
        .filter(|(_, data)| !data.is_empty())
        .map(|(sec, data)| MemorySegment {
            name: sec.name().unwrap_or("").to_string(),
            address: sec.addr,
            bytes: data.to_vec(),
            executable: sec.flags & exec_flags != 0,
        })
        .collect();

    let mut symbols = Vec::new();
    for sym in bin.symbols() {
        let Ok((name, nlist)) = sym else { continue };
        if nlist.n_value == 0 {
            continue;
        }
        let name = name.trim_start_matches('_');
        if name.is_empty() {
            continue;
        }
        symbols.push(ImageSymbol { name: name.to_string(), address: nlist.n_value });
    }

    let entry = (bin.entry != 0).then_some(bin.entry);
    LoadedImage { path: path.to_path_buf(), arch, entry, segments, symbols, listing: Vec::new() }
}

impl ImageLoader for GoblinLoader {
    fn name(&self) -> &'static str {
        "goblin"
    }

    fn accepts(&self, _path: &Path, bytes: &[u8]) -> bool {
        matches!(
            Object::parse(bytes),
            Ok(Object::Elf(_)) | Ok(Object::PE(_)) | Ok(Object::Mach(mach::Mach::Binary(_)))
        )
    }

    fn load(&self, path: &Path, bytes: &[u8]) -> Result<LoadedImage, DecodeError> {
        let object = Object::parse(bytes).map_err(|e| DecodeError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let image = match object {
            Object::Elf(elf) => load_elf(path, bytes, &elf),
            Object::PE(pe) => load_pe(path, bytes, &pe),
            Object::Mach(mach::Mach::Binary(bin)) => load_mach(path, &bin),
            _ => return Err(DecodeError::UnrecognizedFormat(path.to_path_buf())),
        };
        log::debug!(
            "goblin loaded {} ({}): {} segments, {} symbols",
            path.display(),
            image.arch,
            image.segments.len(),
            image.symbols.len()
        );
        Ok(image)
    }
}

fn make_cs(arch: &Architecture) -> Result<Capstone, DecodeError> {
    let built = match arch {
        Architecture::X86_64 => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build()
        }
        Architecture::X86 => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build()
        }
        Architecture::Arm => {
            Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build()
        }
        Architecture::Thumb => {
            Capstone::new().arm().mode(arch::arm::ArchMode::Thumb).detail(true).build()
        }
        Architecture::Arm64 => {
            Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build()
        }
        Architecture::RiscV64 => {
            Capstone::new().riscv().mode(arch::riscv::ArchMode::RiscV64).detail(true).build()
        }
        Architecture::RiscV32 => {
            Capstone::new().riscv().mode(arch::riscv::ArchMode::RiscV32).detail(true).build()
        }
        other => return Err(DecodeError::Backend(format!("capstone has no mode for {other}"))),
    };
    built.map_err(|e| DecodeError::Backend(format!("capstone init failed: {e}")))
}

/// Bytes to skip past an undecodable encoding.
fn resync_step(arch: &Architecture) -> usize {
    match arch {
        Architecture::X86 | Architecture::X86_64 => 1,
        Architecture::Thumb | Architecture::RiscV32 | Architecture::RiscV64 => 2,
        _ => 4,
    }
}

fn in_group(detail: &InsnDetail, group: u8) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group))
}

/// Absolute immediate target, if the instruction has one.
fn decode_target(detail: &InsnDetail, address: Address) -> Option<Address> {
    detail.arch_detail().operands().iter().find_map(|op| match op {
        capstone::arch::ArchOperand::X86Operand(op) => match op.op_type {
            capstone::arch::x86::X86OperandType::Imm(imm) => Some(imm as u64),
            _ => None,
        },
        capstone::arch::ArchOperand::ArmOperand(op) => match op.op_type {
            capstone::arch::arm::ArmOperandType::Imm(imm) => Some(imm as u32 as u64),
            _ => None,
        },
        capstone::arch::ArchOperand::Arm64Operand(op) => match op.op_type {
            capstone::arch::arm64::Arm64OperandType::Imm(imm) => Some(imm as u64),
            _ => None,
        },
        capstone::arch::ArchOperand::RiscVOperand(op) => match op {
            capstone::arch::riscv::RiscVOperand::Imm(imm) => Some(address.wrapping_add(*imm as u64)),
            _ => None,
        },
        _ => None,
    })
}

const ARM_CONDITIONS: [&str; 16] = [
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

fn is_conditional(arch: &Architecture, mnemonic: &str) -> bool {
    let m = mnemonic.trim_end_matches(".w").trim_end_matches(".n");
    match arch {
        Architecture::X86 | Architecture::X86_64 => {
            (m.starts_with('j') && m != "jmp") || m.starts_with("loop")
        }
        Architecture::Arm | Architecture::Thumb => {
            matches!(m, "cbz" | "cbnz")
                || m.strip_prefix('b').is_some_and(|cc| ARM_CONDITIONS.contains(&cc))
        }
        Architecture::Arm64 => {
            m.starts_with("b.") || matches!(m, "cbz" | "cbnz" | "tbz" | "tbnz")
        }
        Architecture::RiscV32 | Architecture::RiscV64 => m.starts_with('b'),
        _ => false,
    }
}

fn classify(
    arch: &Architecture,
    insn: &Insn,
    detail: &InsnDetail,
) -> (InstructionType, Option<Address>) {
    let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
    let operands = insn.op_str().unwrap_or("").to_ascii_lowercase();
    let target = decode_target(detail, insn.address());

    if in_group(detail, capstone::InsnGroupType::CS_GRP_RET as u8)
        || (mnemonic == "bx" && operands == "lr")
        || (mnemonic.starts_with("pop") && operands.contains("pc"))
    {
        return (InstructionType::Return, None);
    }
    if in_group(detail, capstone::InsnGroupType::CS_GRP_INT as u8)
        || in_group(detail, capstone::InsnGroupType::CS_GRP_IRET as u8)
        || matches!(mnemonic.as_str(), "hlt" | "ud2" | "udf" | "brk" | "ebreak" | "ecall")
    {
        return (InstructionType::Trap, None);
    }
    if in_group(detail, capstone::InsnGroupType::CS_GRP_CALL as u8) {
        return match target {
            Some(t) => (InstructionType::DirectCall, Some(t)),
            None => (InstructionType::IndirectCall, None),
        };
    }
    if in_group(detail, capstone::InsnGroupType::CS_GRP_JUMP as u8) {
        return match target {
            Some(t) if is_conditional(arch, &mnemonic) => (InstructionType::ConditionalBranch, Some(t)),
            Some(t) => (InstructionType::DirectBranch, Some(t)),
            None => (InstructionType::IndirectBranch, None),
        };
    }
    (InstructionType::Sequential, None)
}

impl CapstoneDecoder {
    fn sweep(
        cs: &Capstone,
        arch: &Architecture,
        segment: &MemorySegment,
        budget: usize,
        out: &mut DecodeOutput,
    ) {
        let step = resync_step(arch);
        let mut offset = 0usize;
        let mut gap: Option<(Address, usize)> = None;
        while offset < segment.bytes.len() && out.instructions.len() < budget {
            let address = segment.address + offset as u64;
            let insns = match cs.disasm_all(&segment.bytes[offset..], address) {
                Ok(insns) => insns,
                Err(e) => {
                    out.fault = Some(format!("capstone failed at {}: {e}", format_address(address)));
                    return;
                }
            };
            if insns.is_empty() {
                let skipped = step.min(segment.bytes.len() - offset);
                let (_, len) = gap.get_or_insert((address, 0));
                *len += skipped;
                out.skipped_bytes += skipped;
                offset += skipped;
                continue;
            }
            if let Some((start, len)) = gap.take() {
                warn_gap(&segment.name, start, len);
            }
            for insn in insns.iter() {
                if out.instructions.len() >= budget {
                    return;
                }
                let (kind, target) = match cs.insn_detail(insn) {
                    Ok(detail) => classify(arch, insn, &detail),
                    Err(_) => (InstructionType::Unknown, None),
                };
                let text = format!("{} {}", insn.mnemonic().unwrap_or(""), insn.op_str().unwrap_or(""));
                out.instructions.push(
                    Instruction::new(insn.address(), insn.bytes().to_vec(), kind)
                        .with_targets(target)
                        .with_text(text.trim()),
                );
                offset = (insn.address() - segment.address) as usize + insn.bytes().len();
            }
        }
        if let Some((start, len)) = gap {
            warn_gap(&segment.name, start, len);
        }
    }
}

fn warn_gap(section: &str, start: Address, len: usize) {
    log::warn!("skipped {len} undecodable bytes in {section} at {}", format_address(start));
}

impl Decoder for CapstoneDecoder {
    fn name(&self) -> &'static str {
        "capstone"
    }

    fn supports(&self, arch: &Architecture) -> bool {
        !matches!(arch, Architecture::Listing | Architecture::Unsupported(_))
    }

    fn decode(&self, image: &LoadedImage, options: &DecodeOptions) -> Result<DecodeOutput, DecodeError> {
        let cs = make_cs(&image.arch)?;
        let budget = options.max_instructions.unwrap_or(usize::MAX);
        let mut out = DecodeOutput::default();
        for segment in image.executable_segments() {
            Self::sweep(&cs, &image.arch, segment, budget, &mut out);
            if out.fault.is_some() {
                break;
            }
        }
        log::debug!(
            "capstone {} decoded {} instructions from {}",
            capstone_version(),
            out.instructions.len(),
            image.path.display()
        );
        Ok(out)
    }
}
