use predicates::prelude::*;
use rstest::rstest;

mod common;

#[test]
fn test_ship_list_empty_json() {
    let mut ctx = common::shipyard();
    let output = ctx
        .cmd
        .args(["ship", "list", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let rows: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(rows, serde_json::json!([]));
}

#[rstest]
#[case::stop(&["ship", "stop", "web"])]
#[case::force_stop(&["ship", "stop", "--force", "web"])]
fn test_daemon_unreachable_hint(#[case] args: &[&str]) {
    let mut ctx = common::shipyard();
    ctx.cmd
        .args(args)
        .assert()
        .failure()
        .stderr(predicate::str::contains("daemon unreachable"))
        .stderr(predicate::str::contains("shipyard daemon start"));
}

#[test]
fn test_deploy_unknown_crate() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .args(["ship", "deploy", "web", "--image", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("ghost"));
}

#[rstest]
#[case::start(&["ship", "start", "web"])]
#[case::restart(&["ship", "restart", "web"])]
#[case::remove(&["ship", "remove", "web"])]
fn test_unknown_ship(#[case] args: &[&str]) {
    let mut ctx = common::shipyard();
    ctx.cmd.args(args).assert().failure();
}

#[test]
fn test_remove_unknown_ship_names_it() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .args(["ship", "rm", "web"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error removing ship 'web'"));
}
