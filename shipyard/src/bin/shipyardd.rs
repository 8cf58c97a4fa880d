//! Shipyard daemon binary.
//!
//! Owns the control socket, spawns ships detached from their clients and
//! keeps ship rows consistent with OS process liveness. Normally launched by
//! `shipyard daemon start`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use shipyard::daemon::{ChrootLauncher, Daemon, DaemonContext};
use shipyard::util::{self, SystemSignals, remove_pid_file};
use shipyard::{ShipyardOptions, ShipyardRuntime};
use shipyard_shared::constants::{daemon as daemon_consts, envs};
use shipyard_shared::errors::ShipyardResult;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shipyard daemon - supervises ships behind the control socket")]
struct DaemonArgs {
    /// Base directory (crates, ships, logs, database)
    #[arg(long, env = envs::SHIPYARD_HOME)]
    home: Option<PathBuf>,

    /// Control socket address
    #[arg(long, env = envs::SHIPYARD_DAEMON_ADDR)]
    addr: Option<String>,

    /// Seconds between liveness reconciliation passes
    #[arg(long, env = envs::SHIPYARD_RECONCILE_SECS)]
    reconcile_secs: Option<u64>,
}

impl DaemonArgs {
    fn into_options(self) -> ShipyardOptions {
        let mut options = ShipyardOptions::default();
        if let Some(home) = self.home {
            options.home_dir = home;
        }
        if let Some(addr) = self.addr {
            options.daemon_addr = addr;
        }
        if let Some(secs) = self.reconcile_secs {
            options.reconcile_interval = Duration::from_secs(secs);
        }
        options
    }
}

/// Remove the PID file on panic so a crashed daemon never looks alive.
fn install_panic_hook(pid_file: PathBuf) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(%info, "Daemon panicked, shutting down");
        let _ = remove_pid_file(&pid_file);
        default_hook(info);
    }));
}

fn main() -> ShipyardResult<()> {
    let options = DaemonArgs::parse().into_options();
    let runtime = ShipyardRuntime::open(options)?;

    // Keep guard alive until end of main to ensure logs are written
    let log_file = format!("{}.log", daemon_consts::NAME);
    let _log_guard = util::init_file_logging(&runtime.layout().logs_dir(), &log_file)?;

    install_panic_hook(runtime.layout().pid_file());

    tracing::info!(
        home = %runtime.options().home_dir.display(),
        addr = %runtime.options().daemon_addr,
        reconcile_secs = runtime.options().reconcile_interval.as_secs(),
        "Daemon starting"
    );

    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tokio_rt.block_on(async move {
        let (ctx, events) =
            DaemonContext::new(&runtime, Arc::new(ChrootLauncher), Arc::new(SystemSignals));
        let mut daemon = Daemon::new(ctx, events);

        if let Err(e) = daemon.start().await {
            tracing::error!(error = %e, "Daemon failed to start");
            return Err(e);
        }
        daemon.run().await
    })?;

    tracing::info!("Daemon stopped");
    Ok(())
}
