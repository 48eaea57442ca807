use statewalk_core::annotations::{Annotation, AnnotationPersistence};
use statewalk_core::db::{BinaryRecord, ProjectConfig, ProjectContext, ProjectLayout};
use statewalk_core::services::{default_registry, LoadedBinary, SessionConfig};

fn init_project(root: &std::path::Path) -> ProjectLayout {
    let layout = ProjectLayout::new(root);
    std::fs::create_dir_all(&layout.meta_dir).unwrap();
    let config = ProjectConfig::new("CtxProject", layout.db_path_relative_string());
    std::fs::write(&layout.project_config_path, serde_json::to_string_pretty(&config).unwrap())
        .unwrap();
    layout
}

#[test]
fn project_context_loads_config_and_db() {
    let temp = tempfile::tempdir().unwrap();
    init_project(temp.path());

    let ctx = ProjectContext::from_root(temp.path()).expect("context");
    assert_eq!(ctx.config.name, "CtxProject");
    assert!(ctx.db_path.is_file());

    // DB should be initialized and usable.
    ctx.db.list_binaries().expect("list binaries");
}

#[test]
fn missing_config_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let err = ProjectContext::from_root(temp.path()).unwrap_err();
    assert!(err.to_string().contains("project config"));
}

#[test]
fn session_annotations_survive_through_the_project_db() {
    let temp = tempfile::tempdir().unwrap();
    init_project(temp.path());
    let listing = temp.path().join("fw.json");
    std::fs::write(
        &listing,
        r#"{"symbols":[{"name":"main","address":16}],
            "instructions":[{"address":16,"bytes":"01","type":"return"}]}"#,
    )
    .unwrap();

    let ctx = ProjectContext::from_root(temp.path()).unwrap();
    ctx.db.insert_binary(&BinaryRecord::new("fw", "fw.json")).unwrap();
    let store = ctx.db.annotations_for("fw");

    let registry = default_registry();
    let mut session = LoadedBinary::open(&registry, &listing, SessionConfig::default()).unwrap();
    session.insert_annotation(Annotation::comment(16, "only block"));
    session.save_annotations(&store).unwrap();
    assert_eq!(store.load_annotations().unwrap().len(), 2);

    let mut fresh = LoadedBinary::new(&registry, SessionConfig::default());
    assert_eq!(fresh.load_annotations(&store).unwrap(), 2);
    assert_eq!(fresh.annotations().entry_points()[0].name, "main");
}
