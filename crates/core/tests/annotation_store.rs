use statewalk_core::annotations::{
    Annotation, AnnotationError, AnnotationKind, AnnotationPayload, AnnotationStore,
    InstructionTypeAnnotation, LoadReference, UpdateType,
};
use statewalk_core::model::{Address, InstructionType};

#[test]
fn add_rejects_unknown_kind_and_leaves_store_unchanged() {
    let mut store = AnnotationStore::new();
    let err = store.add_annotation("bookmark", 0x10, serde_json::json!({})).unwrap_err();
    assert!(matches!(err, AnnotationError::InvalidAnnotationKind(ref k) if k == "bookmark"));
    assert!(store.is_empty());
    assert!(!store.is_dirty());
}

#[test]
fn index_is_only_rebuilt_on_reindex() {
    let mut store = AnnotationStore::new();
    let h = store
        .add_annotation("comment", 0x10, serde_json::json!({"comment": "checksum loop"}))
        .unwrap();
    assert!(store.is_dirty());
    assert!(store.annotations_at(0x10).is_empty());

    store.reindex();
    assert!(!store.is_dirty());
    assert_eq!(store.annotations_at(0x10).into_iter().collect::<Vec<_>>(), vec![h]);
}

#[test]
fn same_address_may_hold_duplicate_annotations() {
    let mut store = AnnotationStore::new();
    let a = store.insert(Annotation::comment(0x20, "same"));
    let b = store.insert(Annotation::comment(0x20, "same"));
    store.reindex();
    assert_ne!(a, b);
    assert_eq!(store.annotations_at(0x20).len(), 2);
}

#[test]
fn removing_absent_handle_is_noop() {
    let mut store = AnnotationStore::new();
    let h = store.insert(Annotation::comment(0x20, "x"));
    assert!(store.remove_annotation(h).is_some());
    assert!(store.remove_annotation(h).is_none());
    assert!(store.is_empty());
}

#[test]
fn associated_addresses_union_load_reference_operands() {
    let mut store = AnnotationStore::new();
    store.insert(Annotation::load_reference(
        0x100,
        LoadReference {
            update_type: UpdateType::SignatureLoad,
            addr_load: Some(0xfc),
            data_load: Some(0x8000),
        },
    ));
    store.insert(Annotation::comment(0x100, "not a reference"));
    store.reindex();
    let addrs: Vec<Address> = store.associated_addresses(0x100).into_iter().collect();
    assert_eq!(addrs, vec![0xfc, 0x100, 0x8000]);
    assert!(store.associated_addresses(0x104).is_empty());
}

#[test]
fn create_uses_default_payloads() {
    let mut store = AnnotationStore::new();
    let h = store.create("entrypoint", 0x4010).unwrap();
    assert_eq!(store.get(h).unwrap().describe(), "sub_4010");
    let h = store.create("load_ref", 0x4010).unwrap();
    assert_eq!(
        store.get(h).unwrap().describe(),
        "updateType=CONSTANT_LOAD, addrLoad=0x00000000, dataLoad=0x00000000"
    );
}

#[test]
fn later_override_wins() {
    let store = AnnotationStore::from_annotations([
        Annotation::instruction_type(0x8, InstructionType::Sequential),
        Annotation::instruction_type(0x8, InstructionType::IndirectBranch),
    ]);
    assert_eq!(store.instruction_overrides().get(&0x8), Some(&InstructionType::IndirectBranch));
}

#[test]
fn fields_are_parsed_per_kind() {
    let mut store = AnnotationStore::new();
    let h = store
        .add_annotation(
            "inst_type",
            0x30,
            serde_json::json!({"instruction_type": "branch.indirect"}),
        )
        .unwrap();
    assert_eq!(store.get(h).unwrap().describe(), "INDIRECT_BRANCH");

    let err = store
        .add_annotation("load_ref", 0x30, serde_json::json!({"update_type": "BOGUS"}))
        .unwrap_err();
    assert!(matches!(err, AnnotationError::InvalidFields { kind: AnnotationKind::LoadReference, .. }));
}

#[test]
fn unrecognized_instruction_type_string_becomes_unknown() {
    let mut store = AnnotationStore::new();
    let h = store
        .add_annotation("inst_type", 0x30, serde_json::json!({"instruction_type": "jump.weird"}))
        .unwrap();
    assert_eq!(
        store.get(h).unwrap().payload,
        AnnotationPayload::InstructionType(InstructionTypeAnnotation {
            instruction_type: InstructionType::Unknown,
        })
    );
    assert_eq!(store.instruction_overrides().get(&0x30), Some(&InstructionType::Unknown));
}
