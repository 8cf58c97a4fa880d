//! Fixtures for shipyard integration tests.
//!
//! Everything here runs unprivileged: [`RecordingMounter`] fakes overlay
//! mounts with a symlink from merge to upper, [`HostExecutor`] and
//! [`HostLauncher`] run commands on the host inside the root directory
//! instead of chrooting, and [`SpySignals`] records every signal sent.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shipyard::daemon::{Daemon, DaemonContext, ProcessLauncher};
use shipyard::exec::{OutputSink, RootEnv, RootExecutor, run_streaming, split_command};
use shipyard::overlay::Mounter;
use shipyard::util::{Delivery, Liveness, SignalSender, SystemSignals};
use shipyard::{
    CrateRecord, DaemonClient, FilesystemLayout, ShipRecord, ShipyardOptions, ShipyardRuntime,
};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fake mounter: an overlay mount replaces the merge directory with a
/// symlink to upper, so writes through merge land in upper. Virtual
/// filesystem mounts are only recorded.
#[derive(Default)]
pub struct RecordingMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mount/unmount call so far, e.g. `"overlay <lowerdir>"`, `"umount web_merge"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounted.lock().contains(path)
    }

    fn under_mounted_merge(&self, path: &Path) -> bool {
        self.mounted
            .lock()
            .iter()
            .any(|m| path != m && path.starts_with(m))
    }
}

impl Mounter for RecordingMounter {
    fn create_dir_all(&self, path: &Path) -> ShipyardResult<()> {
        // mount points for virtual filesystems would leak into upper
        if self.under_mounted_merge(path) {
            return Ok(());
        }
        if path.symlink_metadata().is_ok() {
            return Ok(());
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn is_mountpoint(&self, path: &Path) -> ShipyardResult<bool> {
        Ok(self.is_mounted(path))
    }

    fn mount_overlay(
        &self,
        lowerdir: &str,
        upper: &Path,
        _work: &Path,
        merge: &Path,
    ) -> ShipyardResult<()> {
        if merge.is_dir() && !merge.is_symlink() {
            std::fs::remove_dir(merge)?;
        }
        std::os::unix::fs::symlink(upper, merge)?;
        self.calls.lock().push(format!("overlay {}", lowerdir));
        self.mounted.lock().insert(merge.to_path_buf());
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> ShipyardResult<()> {
        self.calls.lock().push(format!("bind {}", source.display()));
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    fn mount_devpts(&self, target: &Path) -> ShipyardResult<()> {
        self.calls.lock().push("devpts".to_string());
        self.mounted.lock().insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> ShipyardResult<()> {
        if !self.mounted.lock().remove(target) {
            return Err(ShipyardError::Unmount(format!("{} not mounted", target.display())));
        }
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().push(format!("umount {}", name));

        if target.is_symlink() {
            std::fs::remove_file(target)?;
            std::fs::create_dir_all(target)?;
        }
        Ok(())
    }
}

fn host_dir(root: &Path, workdir: &str) -> PathBuf {
    root.join(workdir.trim_start_matches('/'))
}

/// Runs build commands on the host with the root's work directory as cwd.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostExecutor;

impl RootExecutor for HostExecutor {
    fn run_in_root(
        &self,
        root: &Path,
        env: &RootEnv,
        command: &str,
        sink: &OutputSink,
    ) -> ShipyardResult<i32> {
        let tokens = split_command(command)?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(ShipyardError::Config("empty command".into()));
        };
        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .current_dir(host_dir(root, &env.workdir))
            .envs(&env.vars);
        run_streaming(cmd, command, sink)
    }
}

/// One ship launch seen by [`HostLauncher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRecord {
    pub root: PathBuf,
    pub workdir: String,
    pub vars: BTreeMap<String, String>,
    pub tokens: Vec<String>,
}

/// Launches ship processes on the host with the work directory inside the
/// given root as cwd, and records every launch.
///
/// The fake mounter only exposes upper, so a work directory that came from
/// a lower layer is created on demand.
#[derive(Debug, Default)]
pub struct HostLauncher {
    launches: Mutex<Vec<LaunchRecord>>,
}

impl HostLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().clone()
    }
}

impl ProcessLauncher for HostLauncher {
    fn command(&self, root: &Path, env: &RootEnv, tokens: &[String]) -> tokio::process::Command {
        self.launches.lock().push(LaunchRecord {
            root: root.to_path_buf(),
            workdir: env.workdir.clone(),
            vars: env.vars.clone(),
            tokens: tokens.to_vec(),
        });

        let cwd = host_dir(root, &env.workdir);
        if root.is_dir() {
            let _ = std::fs::create_dir_all(&cwd);
        }

        let program = tokens.first().map(String::as_str).unwrap_or("true");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(tokens.iter().skip(1)).current_dir(cwd).envs(&env.vars);
        cmd
    }
}

/// Which signal a [`SpySignals`] call carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentSignal {
    Term,
    Kill,
}

/// Real signal delivery that remembers what was sent.
#[derive(Default)]
pub struct SpySignals {
    sent: Mutex<Vec<(SentSignal, u32)>>,
}

impl SpySignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(SentSignal, u32)> {
        self.sent.lock().clone()
    }
}

impl SignalSender for SpySignals {
    fn terminate(&self, pid: u32) -> ShipyardResult<Delivery> {
        self.sent.lock().push((SentSignal::Term, pid));
        SystemSignals.terminate(pid)
    }

    fn kill(&self, pid: u32) -> ShipyardResult<Delivery> {
        self.sent.lock().push((SentSignal::Kill, pid));
        SystemSignals.kill(pid)
    }

    fn probe(&self, pid: u32) -> Liveness {
        SystemSignals.probe(pid)
    }
}

/// Temporary home directory with a runtime over a [`RecordingMounter`].
///
/// Daemon timings are shortened so liveness tests finish in well under a
/// second per interval.
pub struct TestHome {
    temp: TempDir,
    runtime: ShipyardRuntime,
    mounter: Arc<RecordingMounter>,
}

impl TestHome {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let mut options = ShipyardOptions::with_home(temp.path().join("home"));
        options.daemon_addr = "127.0.0.1:0".to_string();
        options.reconcile_interval = Duration::from_millis(200);
        options.health_probe_interval = Duration::from_millis(100);
        options.stop_grace_period = Duration::from_millis(300);

        let mounter = Arc::new(RecordingMounter::new());
        let runtime = ShipyardRuntime::with_mounter(options, mounter.clone()).expect("open runtime");
        runtime.init_root_layer(None).expect("init root layer");

        Self {
            temp,
            runtime,
            mounter,
        }
    }

    pub fn runtime(&self) -> &ShipyardRuntime {
        &self.runtime
    }

    pub fn layout(&self) -> &FilesystemLayout {
        self.runtime.layout()
    }

    pub fn mounter(&self) -> &RecordingMounter {
        &self.mounter
    }

    /// Scratch directory outside the home, for build contexts and files.
    pub fn scratch(&self) -> PathBuf {
        let dir = self.temp.path().join("scratch");
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    /// Build a crate with [`HostExecutor`].
    pub fn build(&self, name: &str, build_file: &str, context: &Path) -> ShipyardResult<CrateRecord> {
        self.runtime
            .builder(Arc::new(HostExecutor))
            .build(name, build_file, context)
    }

    /// Build crate `name` on `base`. Its only content is a `<name>.layer`
    /// marker, so every layer archives to a distinct digest.
    pub fn build_layer(&self, name: &str, base: &str) -> CrateRecord {
        let yaml = format!(
            "build_context:\n  base_image: {base}\nbuild_steps:\n  - action: execute_command\n    command: [\"touch {name}.layer\"]\nruntime_command: [\"true\"]\n"
        );
        self.build(name, &yaml, &self.scratch()).expect("build layer")
    }

    pub fn ship(&self, name: &str) -> Option<ShipRecord> {
        self.runtime.db().ships().get(name).expect("query ship")
    }

    /// Start a daemon on an ephemeral port with [`HostLauncher`] and a spy.
    pub async fn start_daemon(&self) -> TestDaemon {
        let launcher = Arc::new(HostLauncher::new());
        let signals = Arc::new(SpySignals::new());
        let (ctx, events) = DaemonContext::new(&self.runtime, launcher.clone(), signals.clone());
        let mut daemon = Daemon::new(ctx, events);
        let addr = daemon.start().await.expect("start daemon");
        let shutdown = daemon.shutdown_token();
        let handle = tokio::spawn(daemon.run());

        TestDaemon {
            addr,
            client: DaemonClient::new(addr.to_string()),
            launcher,
            signals,
            shutdown,
            handle,
        }
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// A daemon running inside the test's tokio runtime.
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub client: DaemonClient,
    pub launcher: Arc<HostLauncher>,
    pub signals: Arc<SpySignals>,
    shutdown: CancellationToken,
    handle: JoinHandle<ShipyardResult<()>>,
}

impl TestDaemon {
    /// Cancel the daemon and wait for it to drain.
    pub async fn stop(self) -> ShipyardResult<()> {
        self.shutdown.cancel();
        self.handle
            .await
            .map_err(|e| ShipyardError::Internal(format!("daemon task: {}", e)))?
    }
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
