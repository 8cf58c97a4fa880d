use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use clap::Subcommand;
use shipyard::util::{self, PidFileStatus, SignalSender, SystemSignals, pid_file_status};
use shipyard_shared::constants::daemon as daemon_consts;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon
    Stop,
    /// Show whether the daemon is running
    Status,
    /// Stop the daemon if running, then start it
    Restart,
}

pub async fn execute(cmd: DaemonCommand, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let runtime = global.create_runtime()?;
    let pid_file = runtime.layout().pid_file();

    match cmd {
        DaemonCommand::Start => start(global, &pid_file).await,
        DaemonCommand::Stop => stop(&pid_file).await,
        DaemonCommand::Status => {
            match pid_file_status(&pid_file) {
                PidFileStatus::Live(pid) => {
                    let addr = runtime.options().daemon_addr.clone();
                    if global.client().is_reachable().await {
                        println!("running (pid {}, listening on {})", pid, addr);
                    } else {
                        println!("running (pid {}), control socket {} not answering", pid, addr);
                    }
                }
                PidFileStatus::Stale(_) => println!("not running (stale PID file)"),
                PidFileStatus::Missing => println!("not running"),
            }
            Ok(())
        }
        DaemonCommand::Restart => {
            if let PidFileStatus::Live(_) = pid_file_status(&pid_file) {
                stop(&pid_file).await?;
            }
            start(global, &pid_file).await
        }
    }
}

async fn start(global: &crate::cli::GlobalFlags, pid_file: &Path) -> anyhow::Result<()> {
    if let PidFileStatus::Live(pid) = pid_file_status(pid_file) {
        println!("{} is already running (pid {})", daemon_consts::NAME, pid);
        return Ok(());
    }

    let binary = util::find_binary(daemon_consts::NAME)?;
    let options = global.options();
    tracing::debug!(binary = %binary.display(), "Launching daemon");

    let mut command = Command::new(&binary);
    command
        .arg("--home")
        .arg(&options.home_dir)
        .arg("--addr")
        .arg(&options.daemon_addr)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    let mut child = command
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to launch {}: {}", binary.display(), e))?;

    let client = global.client();
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let PidFileStatus::Live(pid) = pid_file_status(pid_file)
            && client.is_reachable().await
        {
            println!("{} started (pid {}, listening on {})", daemon_consts::NAME, pid, options.daemon_addr);
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            anyhow::bail!(
                "{} exited during startup ({}); see {}",
                daemon_consts::NAME,
                status,
                options.home_dir.join("logs").display()
            );
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "{} did not start listening on {} within {}s",
                daemon_consts::NAME,
                options.daemon_addr,
                STARTUP_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn stop(pid_file: &Path) -> anyhow::Result<()> {
    let pid = match pid_file_status(pid_file) {
        PidFileStatus::Live(pid) => pid,
        PidFileStatus::Stale(_) => {
            util::remove_pid_file(pid_file)?;
            println!("{} was not running; removed stale PID file", daemon_consts::NAME);
            return Ok(());
        }
        PidFileStatus::Missing => {
            println!("{} is not running", daemon_consts::NAME);
            return Ok(());
        }
    };

    let signals = SystemSignals;
    signals.terminate(pid)?;

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    while signals.probe(pid).exists() {
        if Instant::now() >= deadline {
            anyhow::bail!(
                "{} (pid {}) did not exit within {}s",
                daemon_consts::NAME,
                pid,
                SHUTDOWN_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    println!("{} stopped", daemon_consts::NAME);
    Ok(())
}
