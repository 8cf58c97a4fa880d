use shipyard_shared::errors::ShipyardResult;

use super::{DaemonContext, teardown_ship};
use crate::util::Liveness;

/// Outcome of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ships recorded as running.
    pub checked: usize,
    /// Ships whose process was gone and were flipped to stopped.
    pub stopped: usize,
    /// Live ships this daemon was not yet supervising.
    pub adopted: usize,
}

/// Correct `running` ship rows against OS liveness.
///
/// Dead processes are recorded as stopped and their roots unmounted. Live
/// ones without a supervisor (spawned by a previous daemon) get a probe.
pub async fn reconcile(ctx: &DaemonContext) -> ShipyardResult<ReconcileReport> {
    let ships = ctx.db.ships();
    let running = ships.list_running()?;
    let mut report = ReconcileReport {
        checked: running.len(),
        ..Default::default()
    };

    for record in running {
        let Some(pid) = record.pid() else {
            continue;
        };
        let _guard = ctx.ship_locks.lock(&record.name).await;

        if ctx.signals.probe(pid) == Liveness::Dead {
            if ships.mark_stopped(&record.name, pid, None)? {
                tracing::info!(ship = %record.name, pid, "Reconciled dead ship to stopped");
                report.stopped += 1;
                teardown_ship(&ctx.overlays, &record.name).await;
            }
            ctx.supervisor.detach(&record.name, pid).await;
        } else if ctx.supervisor.pid_of(&record.name).await != Some(pid) {
            ctx.supervisor.watch_pid(&record.name, pid).await;
            report.adopted += 1;
        }
    }

    tracing::debug!(
        checked = report.checked,
        stopped = report.stopped,
        adopted = report.adopted,
        "Reconciliation pass finished"
    );
    Ok(report)
}
