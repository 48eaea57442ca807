use std::sync::{Arc, Mutex};

use statewalk_core::analysis::StateValue;
use statewalk_core::annotations::Annotation;
use statewalk_core::model::EntryPoint;
use statewalk_core::services::{
    default_registry, AnalysisRegistry, ChangeEvent, DecodeError, ListingLoader, LoadedBinary,
    SessionConfig, SessionError,
};

const LISTING: &str = r#"{
    "entry": 4096,
    "symbols": [{"name": "main", "address": 4096}],
    "segments": [{"name": ".rodata", "address": 32768, "bytes": "11000000"}],
    "instructions": [
        {"address": 4096, "bytes": "aa00", "type": "sequential"},
        {"address": 4098, "bytes": "bb00", "type": "sequential"},
        {"address": 4100, "bytes": "c300", "type": "return"}
    ]
}"#;

fn write_listing(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("image.json");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn load_disassemble_calculate_round() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry();
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut session = LoadedBinary::new(&registry, SessionConfig::default());
    let sink = events.clone();
    session.subscribe(move |event| sink.lock().unwrap().push(event));

    session.load(&write_listing(&dir, LISTING)).unwrap();
    assert_eq!(session.annotations().entry_points(), vec![EntryPoint::new(0x1000, "main")]);

    session.disassemble().unwrap();
    assert_eq!(session.function_at(0x1002).unwrap().name, "main");
    assert_eq!(session.function_start(0x1002), Some(0x1000));
    assert_eq!(session.function_end(0x1002), Some(0x1006));
    assert_eq!(session.entrypoint_at(0x1000).unwrap().name, "main");

    let fixups = session.calculate_states().unwrap();
    assert!(fixups.is_empty());
    assert_eq!(session.states_display(0x1002), "0x000000aa -> 0x00000011");
    assert_eq!(session.states_display(0x2000), format!("{0} -> {0}", " ".repeat(11)));
    assert_eq!(session.update_function_name(), Some("xor"));
    assert_eq!(events.lock().unwrap().last(), Some(&ChangeEvent::StatesChanged));
}

#[test]
fn override_annotation_rebuilds_graph() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry();
    let mut session =
        LoadedBinary::open(&registry, &write_listing(&dir, LISTING), SessionConfig::default())
            .unwrap();
    session.disassemble().unwrap();
    assert_eq!(session.graph().blocks().len(), 1);

    let handle = session
        .add_annotation("inst_type", 0x1000, serde_json::json!({"instruction_type": "return"}))
        .unwrap();
    assert_eq!(session.graph().blocks().len(), 2);
    assert_eq!(session.function_end(0x1000), Some(0x1002));

    session.remove_annotation(handle);
    assert!(session.remove_annotation(handle).is_none());
    assert_eq!(session.graph().blocks().len(), 1);
}

#[test]
fn invalid_kind_is_rejected_without_change() {
    let registry = default_registry();
    let mut session = LoadedBinary::new(&registry, SessionConfig::default());
    let err = session.create_annotation("bookmark", 0x10).unwrap_err();
    assert!(matches!(err, SessionError::InvalidAnnotationKind(_)));
    assert!(session.annotations().is_empty());
}

#[test]
fn decode_fault_keeps_partial_graph() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"{"entry": 0, "instructions": [
        {"address": 0, "bytes": "01", "type": "sequential"},
        {"address": 1, "bytes": "", "type": "sequential"}]}"#;
    let registry = default_registry();
    let mut session =
        LoadedBinary::open(&registry, &write_listing(&dir, body), SessionConfig::default())
            .unwrap();
    let err = session.disassemble().unwrap_err();
    assert!(matches!(err, SessionError::DecodeAborted { decoded: 1, .. }));
    assert_eq!(session.graph().blocks().len(), 1);
    assert!(session.calculate_states().is_ok());
}

#[test]
fn failed_pass_keeps_previous_tables() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry();
    let mut session =
        LoadedBinary::open(&registry, &write_listing(&dir, LISTING), SessionConfig::default())
            .unwrap();
    session.disassemble().unwrap();
    session.calculate_states().unwrap();

    session.create_annotation("load_ref", 0x1002).unwrap();
    let err = session.calculate_states().unwrap_err();
    assert!(matches!(err, SessionError::MissingReference(0x1002)));
    assert_eq!(session.states_at(0x1002).1.map(StateValue::to_u64), Some(0x11));

    session.config_mut().update_function = Some("prince".into());
    assert!(matches!(session.calculate_states(), Err(SessionError::State(_))));
}

#[test]
fn unsupported_image_stays_inert() {
    let registry = AnalysisRegistry::new();
    let dir = tempfile::tempdir().unwrap();
    let err = LoadedBinary::open(&registry, &write_listing(&dir, LISTING), SessionConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::Load(DecodeError::UnrecognizedFormat(_))));

    let mut registry = AnalysisRegistry::new();
    registry.register_loader(ListingLoader);
    let mut session =
        LoadedBinary::open(&registry, &write_listing(&dir, LISTING), SessionConfig::default())
            .unwrap();
    assert!(matches!(session.disassemble(), Err(SessionError::UnsupportedArchitecture(_))));
    assert!(matches!(session.calculate_states(), Err(SessionError::UnsupportedArchitecture(_))));
}

#[test]
fn reload_carries_annotations_over() {
    let dir = tempfile::tempdir().unwrap();
    let registry = default_registry();
    let path = write_listing(&dir, LISTING);
    let mut session = LoadedBinary::open(&registry, &path, SessionConfig::default()).unwrap();
    session.insert_annotation(Annotation::comment(0x1002, "checksum step"));
    session.load(&path).unwrap();
    assert_eq!(session.annotations().len(), 2);
    assert_eq!(session.annotations_at(0x1002).len(), 1);
}
