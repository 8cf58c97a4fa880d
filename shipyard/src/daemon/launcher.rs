//! Spawning ship processes detached from the daemon.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use tokio::process::{Child, Command};

use crate::exec::{RootEnv, STDERR_LOG, STDOUT_LOG, chroot_args};

/// Builds the command that runs a ship's tokens inside its merged root,
/// in the crate's work directory and with its environment.
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, root: &Path, env: &RootEnv, tokens: &[String]) -> Command;
}

/// `chroot <root> <tokens...>` (requires root).
#[derive(Clone, Copy, Debug, Default)]
pub struct ChrootLauncher;

impl ProcessLauncher for ChrootLauncher {
    fn command(&self, root: &Path, env: &RootEnv, tokens: &[String]) -> Command {
        let mut cmd = Command::new("chroot");
        cmd.arg(root).args(chroot_args(env, tokens)).envs(&env.vars);
        cmd
    }
}

/// Spawn a ship process in its own process group with stdin closed and
/// stdout/stderr appended to `log_dir/out.log` and `log_dir/err.log`.
///
/// The child outlives the request that spawned it and is not killed when
/// its handle is dropped.
pub fn spawn_detached(
    launcher: &dyn ProcessLauncher,
    root: &Path,
    env: &RootEnv,
    tokens: &[String],
    log_dir: &Path,
) -> ShipyardResult<Child> {
    std::fs::create_dir_all(log_dir)?;
    let open = |name: &str| {
        let path = log_dir.join(name);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ShipyardError::Storage(format!("open {}: {}", path.display(), e)))
    };

    let mut cmd = launcher.command(root, env, tokens);
    cmd.stdin(Stdio::null())
        .stdout(open(STDOUT_LOG)?)
        .stderr(open(STDERR_LOG)?)
        .process_group(0)
        .kill_on_drop(false);

    cmd.spawn()
        .map_err(|e| ShipyardError::Spawn(format!("{}: {}", tokens.join(" "), e)))
}
