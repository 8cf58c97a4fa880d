//! The ship daemon: control socket, process spawning, supervision and
//! liveness reconciliation.
//!
//! ```text
//! CLI ──Request──► server ──► handler ──► launcher ──► ship process
//!                                │                        │
//!                                ▼                        ▼
//!                             ShipStore ◄── event loop ◄── supervisor
//!                                ▲
//!                           reconcile (timer)
//! ```
//!
//! All ship state lives in the database. The only in-memory state is the
//! [`Supervisor`] map of live process handles and the per-name [`ShipLocks`].

mod client;
mod handler;
mod launcher;
mod reconcile;
mod server;
mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use crate::db::Database;
use crate::overlay::OverlayManager;
use crate::runtime::ShipyardRuntime;
use crate::runtime::layout::RootKind;
use crate::runtime::options::ShipyardOptions;
use crate::util::SignalSender;

pub use client::DaemonClient;
pub use handler::handle;
pub use launcher::{ChrootLauncher, ProcessLauncher, spawn_detached};
pub use reconcile::{ReconcileReport, reconcile};
pub use server::{Daemon, DaemonState};
pub use supervisor::{ExitEvent, ExitOutcome, Supervisor};

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct DaemonContext {
    pub options: ShipyardOptions,
    pub db: Database,
    pub overlays: OverlayManager,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub signals: Arc<dyn SignalSender>,
    pub supervisor: Supervisor,
    pub ship_locks: ShipLocks,
}

/// One async lock per ship name. Requests and exit handling for the same
/// ship hold it, so mounts and teardowns of one root never interleave.
#[derive(Clone, Default)]
pub struct ShipLocks {
    locks: Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ShipLocks {
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // drop unheld entries of other names
            locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

impl DaemonContext {
    /// Build a context over an opened runtime. Returns the receiving end of
    /// the supervisor's exit-event channel, to be drained by [`run_event_loop`].
    pub fn new(
        runtime: &ShipyardRuntime,
        launcher: Arc<dyn ProcessLauncher>,
        signals: Arc<dyn SignalSender>,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let options = runtime.options().clone();
        let (supervisor, events) =
            Supervisor::new(Arc::clone(&signals), options.health_probe_interval);
        let ctx = Self {
            options,
            db: runtime.db().clone(),
            overlays: runtime.overlays().clone(),
            launcher,
            signals,
            supervisor,
            ship_locks: ShipLocks::default(),
        };
        (ctx, events)
    }
}

/// Apply exit events until every sender is gone.
pub async fn run_event_loop(ctx: DaemonContext, mut events: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = events.recv().await {
        apply_exit(&ctx, event).await;
    }
    tracing::debug!("Exit event loop finished");
}

/// Record a process end reported by the supervisor.
///
/// Only the first observer of a death changes the row; the overlay is torn
/// down by whoever applied the transition.
pub(crate) async fn apply_exit(ctx: &DaemonContext, event: ExitEvent) {
    let _guard = ctx.ship_locks.lock(&event.ship).await;
    let ships = ctx.db.ships();
    let applied = match &event.outcome {
        ExitOutcome::Exited(code) => ships.mark_stopped(&event.ship, event.pid, Some(*code)),
        ExitOutcome::Vanished => ships.mark_stopped(&event.ship, event.pid, None),
        ExitOutcome::WaitFailed(reason) => {
            tracing::warn!(ship = %event.ship, pid = event.pid, %reason, "Waiting on ship failed");
            ships.mark_error(&event.ship, event.pid)
        }
    };
    ctx.supervisor.detach(&event.ship, event.pid).await;

    match applied {
        Ok(true) => {
            tracing::info!(ship = %event.ship, pid = event.pid, outcome = ?event.outcome, "Ship ended");
            teardown_ship(&ctx.overlays, &event.ship).await;
        }
        Ok(false) => {
            tracing::debug!(ship = %event.ship, pid = event.pid, "Exit already recorded");
        }
        Err(e) => {
            tracing::error!(ship = %event.ship, pid = event.pid, error = %e, "Failed to record ship exit");
        }
    }
}

/// Mount a ship's runtime root off the async workers (mounting takes a file
/// lock). Returns the merge directory the ship runs in.
pub(crate) async fn mount_ship(
    overlays: &OverlayManager,
    name: &str,
    layers: Vec<String>,
) -> ShipyardResult<PathBuf> {
    let overlays = overlays.clone();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        overlays.create_and_mount(RootKind::Ship, &name, &layers)?;
        Ok(overlays.paths(RootKind::Ship, &name).merge)
    })
    .await
    .map_err(|e| ShipyardError::Internal(format!("mount task failed: {}", e)))?
}

/// Best-effort unmount of a ship's runtime root. Directories are kept until
/// the ship is removed.
pub(crate) async fn teardown_ship(overlays: &OverlayManager, name: &str) {
    let overlays = overlays.clone();
    let owned = name.to_string();
    let result = tokio::task::spawn_blocking(move || overlays.unmount(RootKind::Ship, &owned)).await;

    match result {
        Ok(Ok(())) => tracing::debug!(ship = %name, "Ship root unmounted"),
        Ok(Err(e)) => tracing::warn!(ship = %name, error = %e, "Failed to unmount ship root"),
        Err(e) => tracing::warn!(ship = %name, error = %e, "Unmount task failed"),
    }
}
