use rusqlite::Connection;
use statewalk_core::analysis::{FixupKind, FixupResolution, StateFixup, StateValue};
use statewalk_core::annotations::{
    Annotation, AnnotationError, AnnotationPersistence, LoadReference, UpdateType,
};
use statewalk_core::db::{
    BinaryRecord, CalculationRunRecord, DbError, FixupRecord, ProjectDb, RunStatus,
    CURRENT_SCHEMA_VERSION,
};
use statewalk_core::model::InstructionType;

fn open_temp() -> (tempfile::TempDir, ProjectDb) {
    let dir = tempfile::tempdir().unwrap();
    let db = ProjectDb::open(&dir.path().join("project.db")).unwrap();
    (dir, db)
}

#[test]
fn fresh_db_is_at_current_version() {
    let (_dir, db) = open_temp();
    let version: i32 =
        db.connection().query_row("PRAGMA user_version;", [], |row| row.get(0)).unwrap();
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[test]
fn newer_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("project.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA user_version = 99;").unwrap();
    }
    let err = ProjectDb::open(&path).unwrap_err();
    assert!(matches!(err, DbError::UnsupportedSchemaVersion { found: 99, .. }));
}

#[test]
fn binaries_round_trip_and_lookup() {
    let (_dir, db) = open_temp();
    let mut record = BinaryRecord::new("fw", "bin/fw.elf");
    record.hash = Some("abc".into());
    db.insert_binary(&record).unwrap();
    assert_eq!(db.list_binaries().unwrap(), vec![record.clone()]);
    assert_eq!(db.find_binary("fw").unwrap(), Some(record));
    assert!(db.find_binary("other").unwrap().is_none());

    assert_eq!(db.update_binary_arch("fw", "arm").unwrap(), 1);
    assert_eq!(db.find_binary("fw").unwrap().unwrap().arch.as_deref(), Some("arm"));
    assert!(db.insert_binary(&BinaryRecord::new("fw", "x")).is_err());
}

#[test]
fn annotations_are_replaced_per_binary_in_order() {
    let (_dir, db) = open_temp();
    let first = vec![
        Annotation::entry_point(0x1000, "main"),
        Annotation::comment(0x1004, "init"),
        Annotation::instruction_type(0x1008, InstructionType::Return),
        Annotation::load_reference(
            0x100c,
            LoadReference {
                update_type: UpdateType::ConstInjection,
                addr_load: None,
                data_load: Some(0x8000),
            },
        ),
    ];
    db.save_annotations("fw", &first).unwrap();
    db.save_annotations("other", &[Annotation::comment(0, "x")]).unwrap();
    assert_eq!(db.load_annotations("fw").unwrap(), first);

    db.save_annotations("fw", &first[..1]).unwrap();
    assert_eq!(db.load_annotations("fw").unwrap(), first[..1].to_vec());
    assert_eq!(db.load_annotations("other").unwrap().len(), 1);
    assert!(db.load_annotations("missing").unwrap().is_empty());
}

#[test]
fn corrupt_annotation_row_surfaces_kind_error() {
    let (_dir, db) = open_temp();
    db.connection()
        .execute(
            "INSERT INTO annotations (binary, position, kind, address, fields) VALUES ('fw', 0, 'bogus', 0, '{}')",
            [],
        )
        .unwrap();
    let err = db.annotations_for("fw").load_annotations().unwrap_err();
    assert!(matches!(err, AnnotationError::InvalidAnnotationKind(kind) if kind == "bogus"));
}

#[test]
fn runs_and_fixups_round_trip() {
    let (_dir, db) = open_temp();
    let run = CalculationRunRecord {
        id: None,
        binary: "fw".into(),
        update_function: "xor".into(),
        status: RunStatus::Succeeded,
        started_at: "2026-01-01T00:00:00Z".into(),
        finished_at: "2026-01-01T00:00:01Z".into(),
        fixup_count: 1,
    };
    let run_id = db.insert_calculation_run(&run).unwrap();
    let fixup = StateFixup {
        address: 0x1000,
        kind: FixupKind::MergeConflict,
        expected: Some(StateValue::from_u64(0xaa, 4)),
        computed: StateValue::from_u64(0x11, 4),
        resolution: FixupResolution::Unresolved,
    };
    db.insert_fixups(run_id, &[FixupRecord::from(&fixup)]).unwrap();

    let runs = db.list_runs(Some("fw")).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, Some(run_id));
    assert_eq!(runs[0].status, RunStatus::Succeeded);
    assert!(db.list_runs(Some("other")).unwrap().is_empty());
    assert_eq!(db.list_runs(None).unwrap().len(), 1);
    assert_eq!(db.latest_run_id("fw").unwrap(), Some(run_id));

    let stored = db.list_fixups(run_id).unwrap();
    assert_eq!(stored[0].to_fixup(), Some(fixup));
}
