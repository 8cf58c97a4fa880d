use predicates::prelude::*;

mod common;

#[test]
fn test_help_lists_commands() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("ship"))
        .stdout(predicate::str::contains("daemon"));
}

#[test]
fn test_init_prepares_home() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"));

    let home = ctx.home();
    for dir in ["crates", "ships", "logs", "run", "db"] {
        assert!(home.join(dir).is_dir(), "{} missing", dir);
    }
    assert!(home.join("db/shipyard.db").exists());
}

#[test]
fn test_init_with_missing_rootfs_fails() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .args(["init", "--rootfs", "/nonexistent/rootfs.tar.gz"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rootfs archive"));
}

#[test]
fn test_completion_bash() {
    let mut ctx = common::shipyard();
    ctx.cmd
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("shipyard"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let mut ctx = common::shipyard();
    ctx.cmd.arg("launch").assert().failure();
}
