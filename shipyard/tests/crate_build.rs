//! Integration tests for the build pipeline: layering, archiving, cleanup.

use std::fs::File;
use std::io::Read;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use shipyard::ShipyardError;
use shipyard::layers;
use shipyard::runtime::layout::RootKind;
use shipyard_test_utils::TestHome;

// ============================================================================
// HELPERS
// ============================================================================

fn archive_entries(path: &std::path::Path) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

fn sha256_hex(path: &std::path::Path) -> String {
    let mut bytes = Vec::new();
    File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
    hex::encode(Sha256::digest(&bytes))
}

const DEMO: &str = r#"
build_context:
  base_image: root
build_steps:
  - action: copy_files
    source: a.txt
    destination: /a.txt
runtime_command: ["cat", "/a.txt"]
"#;

// ============================================================================
// END TO END
// ============================================================================

#[test]
fn demo_crate_archives_copied_file_with_matching_digest() {
    let home = TestHome::new();
    let context = home.scratch();
    std::fs::write(context.join("a.txt"), "hello\n").unwrap();

    let record = home.build("demo", DEMO, &context).unwrap();

    assert_eq!(record.name, "demo");
    assert_eq!(record.base_image, "root");

    let archive = home.layout().archive_path("demo");
    assert!(archive_entries(&archive).iter().any(|p| p == "a.txt"));
    assert_eq!(record.digest, sha256_hex(&archive));
    assert_eq!(record.size_bytes, std::fs::metadata(&archive).unwrap().len());

    // build roots are unmounted afterwards
    let paths = home.runtime().overlays().paths(RootKind::Crate, "demo");
    assert!(!home.mounter().is_mounted(&paths.merge));
}

#[test]
fn rebuilding_same_content_gives_same_digest() {
    let home = TestHome::new();
    let context = home.scratch();
    std::fs::write(context.join("a.txt"), "hello\n").unwrap();

    let first = home.build("demo", DEMO, &context).unwrap();
    let second = home.build("demo", DEMO, &context).unwrap();

    assert_eq!(first.digest, second.digest);
    assert_eq!(home.runtime().list_crates().unwrap().len(), 1);
}

#[test]
fn execute_command_runs_in_work_directory() {
    let home = TestHome::new();
    let yaml = r#"
build_context:
  base_image: root
  work_directory: /app
build_steps:
  - action: execute_command
    command:
      - "sh -c 'echo built > marker'"
runtime_command: ["true"]
"#;

    home.build("app", yaml, &home.scratch()).unwrap();

    let upper = home.runtime().overlays().paths(RootKind::Crate, "app").upper;
    assert_eq!(std::fs::read_to_string(upper.join("app/marker")).unwrap(), "built\n");
}

#[test]
fn execute_command_sees_crate_environment() {
    let home = TestHome::new();
    let yaml = r#"
build_context:
  base_image: root
build_steps:
  - action: execute_command
    command:
      - "sh -c 'echo $GREETING > greeting'"
crate_config:
  environment_variables:
    GREETING: ahoy
runtime_command: ["true"]
"#;

    home.build("env", yaml, &home.scratch()).unwrap();

    let upper = home.runtime().overlays().paths(RootKind::Crate, "env").upper;
    assert_eq!(std::fs::read_to_string(upper.join("greeting")).unwrap(), "ahoy\n");
}

#[test]
fn build_output_kept_apart_from_ship_logs() {
    let home = TestHome::new();
    let yaml = r#"
build_context:
  base_image: root
build_steps:
  - action: execute_command
    command: ["echo compiling"]
runtime_command: ["true"]
"#;

    home.build("web", yaml, &home.scratch()).unwrap();

    let build_log = home.layout().build_log_dir("web").join("out.log");
    assert_eq!(std::fs::read_to_string(build_log).unwrap(), "compiling\n");
    assert!(!home.layout().log_dir("web").join("out.log").exists());
}

// ============================================================================
// FAILURE CLEANUP
// ============================================================================

#[test]
fn failing_step_leaves_no_record_or_directories() {
    let home = TestHome::new();
    let yaml = r#"
build_context:
  base_image: root
build_steps:
  - action: execute_command
    command: ["true"]
  - action: execute_command
    command: ["false"]
runtime_command: ["true"]
"#;

    let err = home.build("broken", yaml, &home.scratch()).unwrap_err();
    assert!(matches!(err, ShipyardError::BuildStep { step: 2, .. }), "got {err}");

    let paths = home.runtime().overlays().paths(RootKind::Crate, "broken");
    assert!(home.runtime().db().crates().get_by_name("broken").unwrap().is_none());
    assert!(home.runtime().db().descriptors().get_by_name("broken").unwrap().is_none());
    assert!(!paths.upper.exists());
    assert!(!paths.work.exists());
    assert!(paths.merge.symlink_metadata().is_err());
    assert!(!home.layout().archive_path("broken").exists());
    assert!(!home.mounter().is_mounted(&paths.merge));
}

#[test]
fn missing_copy_source_fails_the_step() {
    let home = TestHome::new();
    let err = home.build("demo", DEMO, &home.scratch()).unwrap_err();
    assert!(matches!(err, ShipyardError::BuildStep { step: 1, .. }));
}

#[test]
fn unknown_base_image_fails_before_mounting() {
    let home = TestHome::new();
    let yaml = "build_context:\n  base_image: nope\nbuild_steps: []\nruntime_command: [\"true\"]\n";

    let err = home.build("child", yaml, &home.scratch()).unwrap_err();
    assert!(matches!(err, ShipyardError::LayerNotFound(ref layer) if layer == "nope"));
    assert_eq!(home.mounter().count("overlay"), 0);
}

// ============================================================================
// LAYERING
// ============================================================================

#[test]
fn identical_content_under_another_name_is_rejected() {
    let home = TestHome::new();
    let context = home.scratch();
    std::fs::write(context.join("a.txt"), "hello\n").unwrap();
    home.build("demo", DEMO, &context).unwrap();

    let err = home.build("copy", DEMO, &context).unwrap_err();
    assert!(matches!(err, ShipyardError::AlreadyExists(_)), "got {err}");
    assert!(!home.runtime().overlays().paths(RootKind::Crate, "copy").upper.exists());
}

#[test]
fn child_crate_mounts_full_ancestor_chain() {
    let home = TestHome::new();
    home.build_layer("base", "root");
    home.build_layer("runtime", "base");
    home.build_layer("app", "runtime");

    let chain = layers::resolve(&home.runtime().db().crates(), "app").unwrap();
    assert_eq!(chain, ["app", "runtime", "base", "root"]);

    let layout = home.layout();
    let expected = format!(
        "overlay {}:{}:{}",
        layout.layer_dir("runtime").display(),
        layout.layer_dir("base").display(),
        layout.layer_dir("root").display()
    );
    assert!(home.mounter().calls().contains(&expected), "{:?}", home.mounter().calls());
}

#[test]
fn crate_with_children_cannot_be_removed() {
    let home = TestHome::new();
    home.build_layer("base", "root");
    home.build_layer("app", "base");

    let err = home.runtime().remove_crate("base").unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidState(_)));

    home.runtime().remove_crate("app").unwrap();
    home.runtime().remove_crate("base").unwrap();
    assert!(home.runtime().list_crates().unwrap().is_empty());
    assert!(!home.layout().archive_path("base").exists());
}
