use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use statewalk_core::db::{ProjectDb, ProjectLayout};
use tempfile::tempdir;

/// `main` at 0x100 calls `helper` at 0x110; a data word 0x5a lives at 0x8000.
const LISTING: &str = r#"{
    "symbols": [
        {"name": "main", "address": 256},
        {"name": "helper", "address": 272}
    ],
    "segments": [{"name": ".rodata", "address": 32768, "bytes": "5a000000"}],
    "instructions": [
        {"address": 256, "bytes": "0f", "type": "sequential"},
        {"address": 257, "bytes": "e8", "type": "call.direct", "targets": [272]},
        {"address": 258, "bytes": "c3", "type": "return"},
        {"address": 272, "bytes": "f0", "type": "sequential"},
        {"address": 273, "bytes": "c3", "type": "return"}
    ]
}"#;

fn statewalk(root: &Path, args: &[&str]) -> assert_cmd::assert::Assert {
    let mut cmd = cargo_bin_cmd!("statewalk");
    cmd.args(args).arg("--root").arg(root);
    cmd.assert()
}

fn project_with_listing() -> tempfile::TempDir {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    statewalk(root, &["init-project", "--name", "Firmware"]).success();
    fs::write(root.join("fw.json"), LISTING).unwrap();
    statewalk(root, &["add-binary", "--path", "fw.json", "--name", "fw"]).success();
    dir
}

#[test]
fn init_project_creates_layout() {
    let dir = tempdir().expect("tempdir");
    statewalk(dir.path(), &["init-project"]).success().stdout(contains("Initialized statewalk project"));

    let layout = ProjectLayout::new(dir.path());
    assert!(layout.project_config_path.is_file());
    assert!(layout.db_path.is_file());
    assert!(layout.annotations_dir.is_dir());
    assert!(layout.reports_dir.is_dir());

    statewalk(dir.path(), &["project-info"]).success().stdout(contains("Calculation runs: 0"));
}

#[test]
fn add_binary_stores_relative_path_and_hash() {
    let dir = project_with_listing();
    let db = ProjectDb::open(&ProjectLayout::new(dir.path()).db_path).expect("open db");
    let binaries = db.list_binaries().expect("list binaries");
    assert_eq!(binaries.len(), 1);
    assert_eq!(binaries[0].path, "fw.json");
    assert_eq!(binaries[0].hash.as_deref().map(str::len), Some(64));

    statewalk(dir.path(), &["add-binary", "--path", "fw.json", "--name", "fw"])
        .failure()
        .stderr(contains("already registered"));
}

#[test]
fn functions_are_bounded_by_entry_points() {
    let dir = project_with_listing();
    statewalk(dir.path(), &["functions", "--binary", "fw"])
        .success()
        .stdout(contains("main [0x00000100 - 0x00000103]"))
        .stdout(contains("helper [0x00000110 - 0x00000112]"));

    statewalk(dir.path(), &["functions", "--binary", "fw", "--unbounded"])
        .success()
        .stdout(contains("main [0x00000100 - 0x00000112]"));

    // The loader's answer replaces the missing architecture hint.
    let db = ProjectDb::open(&ProjectLayout::new(dir.path()).db_path).unwrap();
    assert_eq!(db.find_binary("fw").unwrap().unwrap().arch.as_deref(), Some("listing"));
}

#[test]
fn annotations_can_be_added_listed_and_removed() {
    let dir = project_with_listing();
    let root = dir.path();
    statewalk(
        root,
        &["annotate", "--binary", "fw", "--kind", "comment", "--address", "0x102", "--fields", r#"{"comment":"tail"}"#],
    )
    .success()
    .stdout(contains("Added comment at 0x00000102: tail"));

    statewalk(root, &["list-annotations", "--binary", "fw"])
        .success()
        .stdout(contains("[2] 0x00000102 comment"))
        .stdout(contains("helper"));

    statewalk(root, &["annotate", "--binary", "fw", "--kind", "bookmark", "--address", "0"])
        .failure()
        .stderr(contains("Invalid annotation kind 'bookmark'"));

    statewalk(root, &["remove-annotation", "--binary", "fw", "--index", "2"])
        .success()
        .stdout(contains("Removed comment at 0x00000102"));
    statewalk(root, &["remove-annotation", "--binary", "fw", "--index", "9"])
        .failure()
        .stderr(contains("No annotation at index 9"));
}

#[test]
fn calculate_records_runs_fixups_and_report() {
    let dir = project_with_listing();
    let root = dir.path();

    // Both symbols seed the walk, so `helper` is reached with two states.
    let output = cargo_bin_cmd!("statewalk")
        .args(["calculate", "--binary", "fw", "--json", "--root"])
        .arg(root)
        .output()
        .expect("run calculate");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("report json");
    assert_eq!(report["run"]["status"], "succeeded");
    assert_eq!(report["run"]["update_function"], "xor");
    assert_eq!(report["fixups"][0]["kind"], "merge_conflict");
    assert_eq!(report["fixups"][0]["address"], 0x110);

    statewalk(root, &["calculate", "--binary", "fw", "--stop-at-entrypoints"])
        .success()
        .stdout(contains("succeeded with 'xor' (0 fixups)"));

    let layout = ProjectLayout::new(root);
    assert!(layout.report_path("fw", 1).is_file());
    assert!(layout.report_path("fw", 2).is_file());

    statewalk(root, &["list-runs", "--binary", "fw"])
        .success()
        .stdout(contains("#1 fw [succeeded] update=xor fixups=1"))
        .stdout(contains("#2 fw [succeeded] update=xor fixups=0"));

    let db = ProjectDb::open(&layout.db_path).unwrap();
    assert_eq!(db.list_fixups(1).unwrap().len(), 1);
}

#[test]
fn constant_load_mismatch_is_reported() {
    let dir = project_with_listing();
    let root = dir.path();
    statewalk(
        root,
        &[
            "annotate", "--binary", "fw", "--kind", "load_ref", "--address", "0x100", "--fields",
            r#"{"update_type":"CONSTANT_LOAD","data_load":32768}"#,
        ],
    )
    .success()
    .stdout(contains("updateType=CONSTANT_LOAD, addrLoad=0x00000000, dataLoad=0x00008000"));

    statewalk(root, &["calculate", "--binary", "fw", "--seed-address", "0x100"])
        .success()
        .stdout(contains("0x00000100 reference_mismatch: expected 0x0000005a, computed 0x0000000f [unresolved]"));
}

#[test]
fn states_show_pre_and_post_values() {
    let dir = project_with_listing();
    statewalk(
        dir.path(),
        &["states", "--binary", "fw", "--stop-at-entrypoints", "--seed", "0x01", "0x100", "0x101", "0x200"],
    )
    .success()
    .stdout(contains("0x00000100: 0x00000001 -> 0x0000000e"))
    .stdout(contains("0x00000101: 0x0000000e -> 0x000000e6"))
    .stdout(contains(format!("0x00000200: {0} -> {0}", " ".repeat(11))));
}

#[test]
fn annotations_export_and_import_round_trip() {
    let dir = project_with_listing();
    let root = dir.path();
    statewalk(root, &["annotate", "--binary", "fw", "--kind", "entrypoint", "--address", "0x102"]).success();
    statewalk(root, &["export-annotations", "--binary", "fw", "--format", "yaml"])
        .success()
        .stdout(contains("Exported 3 annotations"));

    let exported = ProjectLayout::new(root).annotation_export_path("fw", "yaml");
    let body = fs::read_to_string(&exported).unwrap();
    assert!(body.contains("sub_102"));

    fs::write(root.join("fw2.json"), LISTING).unwrap();
    statewalk(root, &["add-binary", "--path", "fw2.json", "--name", "fw2", "--skip-hash"]).success();
    statewalk(root, &["import-annotations", "--binary", "fw2", "--file", exported.to_str().unwrap()])
        .success()
        .stdout(contains("Imported 3 annotations for fw2"));
    statewalk(root, &["list-annotations", "--binary", "fw2"]).success().stdout(contains("sub_102"));
}
