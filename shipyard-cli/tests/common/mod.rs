#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Address nothing listens on, so daemon requests fail fast.
pub const DEAD_ADDR: &str = "127.0.0.1:1";

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    /// Another invocation against the same home.
    pub fn new_cmd(&self) -> Command {
        command_for(&self.home())
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn command_for(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_shipyard"));
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("SHIPYARD_HOME");
    cmd.env_remove("SHIPYARD_DAEMON_ADDR");
    cmd.arg("--home").arg(home);
    cmd.arg("--daemon-addr").arg(DEAD_ADDR);
    cmd
}

/// Fresh home directory per test.
pub fn shipyard() -> TestContext {
    let dir = TempDir::new().unwrap();
    let cmd = command_for(&dir.path().join("home"));
    TestContext { cmd, dir }
}
