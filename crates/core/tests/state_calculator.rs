use std::collections::{BTreeMap, BTreeSet};

use statewalk_core::analysis::update::XorUpdate;
use statewalk_core::analysis::{
    FixupKind, FixupResolution, PropagationInput, StateCalculator, StateError,
    StateUpdateFunction, StateValue,
};
use statewalk_core::annotations::{Annotation, AnnotationStore, LoadReference, UpdateType};
use statewalk_core::model::{Address, BlockGraph, Instruction, InstructionType, MemorySegment};

fn graph(insns: Vec<Instruction>) -> BlockGraph {
    BlockGraph::build(insns, &BTreeMap::new(), &BTreeSet::new())
}

fn xor_calc(seeds: &[(Address, u64)]) -> StateCalculator {
    let mut calc = StateCalculator::new(Box::new(XorUpdate));
    for (addr, seed) in seeds {
        calc.define_pre_state(*addr, StateValue::from_u64(*seed, 4));
    }
    calc.prepare().unwrap();
    calc
}

fn input<'a>(
    graph: &'a BlockGraph,
    annotations: &'a AnnotationStore,
    memory: &'a Vec<MemorySegment>,
    entry_points: &'a BTreeSet<Address>,
) -> PropagationInput<'a> {
    PropagationInput { graph, annotations, memory, entry_points }
}

#[test]
fn state_value_renders_big_endian_hex() {
    let v = StateValue::from_u64(0xAA, 4);
    assert_eq!(v.to_string(), "0x000000aa");
    assert_eq!("0x000000aa".parse::<StateValue>().unwrap(), v);
    assert_eq!("0x1".parse::<StateValue>().unwrap(), StateValue::from_bytes(vec![1]));
    assert!("0xzz".parse::<StateValue>().is_err());
}

#[test]
fn calculate_requires_prepare() {
    let g = graph(vec![Instruction::new(0, vec![1], InstructionType::Return)]);
    let store = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = StateCalculator::new(Box::new(XorUpdate));
    assert!(matches!(
        calc.calculate(&input(&g, &store, &mem, &eps)),
        Err(StateError::NotPrepared)
    ));
}

#[test]
fn linear_block_matches_xor_scenario() {
    let g = graph(vec![
        Instruction::new(0x1000, vec![0xAA, 0x00], InstructionType::Sequential),
        Instruction::new(0x1002, vec![0xBB, 0x00], InstructionType::Sequential),
    ]);
    let store = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x1000, 0)]);
    let fixups = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();
    assert!(fixups.is_empty());
    assert_eq!(calc.post_states()[&0x1000].to_u64(), 0xAA);
    assert_eq!(calc.pre_states()[&0x1002].to_u64(), 0xAA);
    assert_eq!(calc.post_states()[&0x1002].to_u64(), 0x11);
}

#[test]
fn loop_back_edge_with_new_value_is_a_single_fixup() {
    // 0x0: body (xor 0x01), 0x1: conditional back to 0x0
    let g = graph(vec![
        Instruction::new(0x0, vec![0x01], InstructionType::Sequential),
        Instruction::new(0x1, vec![0x02], InstructionType::ConditionalBranch).with_targets([0x0]),
        Instruction::new(0x2, vec![0x00], InstructionType::Return),
    ]);
    let store = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x0, 0)]);
    let fixups = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();
    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups[0].address, 0x0);
    assert_eq!(fixups[0].kind, FixupKind::MergeConflict);
    assert_eq!(fixups[0].expected, Some(StateValue::from_u64(0, 4)));
    assert_eq!(fixups[0].computed, StateValue::from_u64(0x03, 4));
    assert_eq!(calc.pre_states()[&0x2].to_u64(), 0x03);
}

#[test]
fn constant_load_mismatch_and_injection() {
    let g = graph(vec![
        Instruction::new(0x10, vec![0x05], InstructionType::Sequential),
        Instruction::new(0x11, vec![0x06], InstructionType::Sequential),
        Instruction::new(0x12, vec![0x00], InstructionType::Return),
    ]);
    let store = AnnotationStore::from_annotations([
        Annotation::load_reference(
            0x10,
            LoadReference {
                update_type: UpdateType::ConstantLoad,
                addr_load: None,
                data_load: Some(0x8000),
            },
        ),
        Annotation::load_reference(
            0x11,
            LoadReference {
                update_type: UpdateType::ConstInjection,
                addr_load: None,
                data_load: Some(0x8004),
            },
        ),
    ]);
    let mem = vec![MemorySegment {
        name: ".rodata".into(),
        address: 0x8000,
        bytes: vec![0x07, 0, 0, 0, 0x40, 0, 0, 0],
        executable: false,
    }];
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x10, 0)]);
    let fixups = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();

    assert_eq!(fixups.len(), 2);
    assert_eq!(fixups[0].kind, FixupKind::ReferenceMismatch);
    assert_eq!(fixups[0].computed.to_u64(), 0x05);
    assert_eq!(fixups[0].expected.as_ref().unwrap().to_u64(), 0x07);
    assert_eq!(fixups[1].kind, FixupKind::Injection);
    assert_eq!(fixups[1].resolution, FixupResolution::AcceptExpected);
    // injected value flows onward
    assert_eq!(calc.post_states()[&0x11].to_u64(), 0x40);
    assert_eq!(calc.pre_states()[&0x12].to_u64(), 0x40);
}

#[test]
fn missing_data_operand_fails_and_keeps_previous_tables() {
    let g = graph(vec![Instruction::new(0x0, vec![0x01], InstructionType::Return)]);
    let empty = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x0, 0)]);
    calc.calculate(&input(&g, &empty, &mem, &eps)).unwrap();
    assert_eq!(calc.post_states().len(), 1);

    let broken = AnnotationStore::from_annotations([Annotation::load_reference(
        0x0,
        LoadReference::default(),
    )]);
    let err = calc.calculate(&input(&g, &broken, &mem, &eps)).unwrap_err();
    assert!(matches!(err, StateError::MissingReference { address: 0x0 }));
    assert_eq!(calc.post_states().len(), 1);
}

#[test]
fn unmapped_reference_is_an_unresolved_fixup() {
    let g = graph(vec![Instruction::new(0x0, vec![0x01], InstructionType::Return)]);
    let store = AnnotationStore::from_annotations([Annotation::load_reference(
        0x0,
        LoadReference { data_load: Some(0xdead_0000), ..Default::default() },
    )]);
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x0, 0)]);
    let fixups = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();
    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups[0].kind, FixupKind::MissingReference);
    assert_eq!(fixups[0].expected, None);
    assert_eq!(calc.post_states()[&0x0].to_u64(), 0x01);
}

#[test]
fn cancellation_aborts_without_replacing_tables() {
    let g = graph(vec![Instruction::new(0x0, vec![0x01], InstructionType::Return)]);
    let store = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x0, 0)]);
    let err = calc.calculate_with(&input(&g, &store, &mem, &eps), &mut || true).unwrap_err();
    assert!(matches!(err, StateError::Cancelled));
    assert!(calc.post_states().is_empty());
}

#[test]
fn three_way_merge_records_one_fixup_per_address() {
    // Three seeded blocks each jump to 0x10 carrying 0x01, 0x02 and 0x03.
    let g = graph(vec![
        Instruction::new(0x0, vec![0x01], InstructionType::DirectBranch).with_targets([0x10]),
        Instruction::new(0x4, vec![0x02], InstructionType::DirectBranch).with_targets([0x10]),
        Instruction::new(0x8, vec![0x03], InstructionType::DirectBranch).with_targets([0x10]),
        Instruction::new(0x10, vec![0x00], InstructionType::Return),
    ]);
    let store = AnnotationStore::new();
    let mem = Vec::new();
    let eps = BTreeSet::new();
    let mut calc = xor_calc(&[(0x0, 0), (0x4, 0), (0x8, 0)]);
    let fixups = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();

    assert_eq!(fixups.len(), 1);
    assert_eq!(fixups[0].address, 0x10);
    assert_eq!(fixups[0].kind, FixupKind::MergeConflict);
    assert_eq!(fixups[0].expected, Some(StateValue::from_u64(0x01, 4)));
    assert_eq!(fixups[0].computed, StateValue::from_u64(0x02, 4));
    assert_eq!(calc.pre_states()[&0x10].to_u64(), 0x01);
}

/// Diamond with a side entry: 0x0 branches to 0x4 or falls to 0x2, both reach 0x6.
fn branching_graph() -> BlockGraph {
    graph(vec![
        Instruction::new(0x0, vec![0x11], InstructionType::Sequential),
        Instruction::new(0x1, vec![0x22], InstructionType::ConditionalBranch).with_targets([0x4]),
        Instruction::new(0x2, vec![0x33], InstructionType::Sequential),
        Instruction::new(0x3, vec![0x44], InstructionType::DirectBranch).with_targets([0x6]),
        Instruction::new(0x4, vec![0x55], InstructionType::Sequential),
        Instruction::new(0x5, vec![0x66], InstructionType::Sequential),
        Instruction::new(0x6, vec![0x77], InstructionType::Sequential),
        Instruction::new(0x7, vec![0x88], InstructionType::Return),
    ])
}

#[test]
fn every_reached_address_obeys_update_and_runs_repeat_exactly() {
    let g = branching_graph();
    let store = AnnotationStore::from_annotations([Annotation::load_reference(
        0x2,
        LoadReference {
            update_type: UpdateType::ConstInjection,
            addr_load: None,
            data_load: Some(0x8000),
        },
    )]);
    let mem = vec![MemorySegment {
        name: ".rodata".into(),
        address: 0x8000,
        bytes: vec![0x99, 0, 0, 0],
        executable: false,
    }];
    let eps = BTreeSet::new();
    let seeds = [(0x0, 0x01), (0x4, 0x02), (0x6, 0x03)];

    let mut calc = xor_calc(&seeds);
    let first = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();
    let (pre, post) = (calc.pre_states().clone(), calc.post_states().clone());
    let second = calc.calculate(&input(&g, &store, &mem, &eps)).unwrap();
    assert_eq!(first, second);
    assert_eq!(&pre, calc.pre_states());
    assert_eq!(&post, calc.post_states());

    let mut fresh = xor_calc(&seeds);
    assert_eq!(fresh.calculate(&input(&g, &store, &mem, &eps)).unwrap(), first);
    assert_eq!(fresh.pre_states(), &pre);
    assert_eq!(fresh.post_states(), &post);

    assert_eq!(pre.len(), 8);
    assert!(pre.keys().eq(post.keys()));
    for (address, before) in &pre {
        let injected = store
            .load_reference_at(*address)
            .is_some_and(|r| r.update_type == UpdateType::ConstInjection);
        if injected {
            assert_eq!(post[address].to_u64(), 0x99);
            continue;
        }
        let insn = g.instruction_at(*address).unwrap();
        assert_eq!(post[address], XorUpdate.update(before, insn).unwrap(), "at {address:#x}");
    }
}
