//! Control request dispatch.

use std::path::Path;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use shipyard_shared::protocol::{Request, Response};
use tracing::{info, warn};

use super::launcher::spawn_detached;
use super::{DaemonContext, mount_ship, teardown_ship};
use crate::build::BuildFile;
use crate::db::CrateRecord;
use crate::exec::{RootEnv, split_command};
use crate::layers;
use crate::runtime::layout::{RootKind, validate_name};
use crate::util::{Delivery, Liveness};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Launch {
    /// New ship; the name must be free.
    Deploy,
    /// Existing ship that is stopped or errored.
    Start,
}

/// Handle one control request. Every failure becomes an error response.
///
/// Requests for the same ship run one at a time.
pub async fn handle(ctx: &DaemonContext, request: Request) -> Response {
    let kind = request.kind();
    let ship = request.ship_name().to_string();
    let _guard = ctx.ship_locks.lock(&ship).await;

    let result = match request {
        Request::Deploy {
            ship_id,
            command,
            log_dir,
            image_id,
        } => launch(ctx, Launch::Deploy, &ship_id, &command, &log_dir, image_id).await,
        Request::Start {
            ship_name,
            command,
            log_dir,
            image_id,
        } => launch(ctx, Launch::Start, &ship_name, &command, &log_dir, image_id).await,
        Request::Stop { ship_name, force } => stop(ctx, &ship_name, force).await,
    };

    result.unwrap_or_else(|e| {
        warn!(request = kind, ship = %ship, error = %e, "Request failed");
        Response::error(e.to_string())
    })
}

async fn launch(
    ctx: &DaemonContext,
    mode: Launch,
    name: &str,
    command: &str,
    log_dir: &Path,
    image_id: i64,
) -> ShipyardResult<Response> {
    validate_name(RootKind::Ship, name)?;

    let ships = ctx.db.ships();
    match (mode, ships.get(name)?) {
        (Launch::Deploy, Some(_)) => {
            return Err(ShipyardError::AlreadyExists(format!(
                "ship '{}' (use start to run it again)",
                name
            )));
        }
        (Launch::Start, None) => return Err(ShipyardError::NotFound(format!("ship '{}'", name))),
        (Launch::Start, Some(record)) if !record.status().can_start() => {
            return Err(ShipyardError::InvalidState(format!(
                "ship '{}' is already {}",
                name,
                record.status()
            )));
        }
        _ => {}
    }

    let image = ctx
        .db
        .crates()
        .get_by_id(image_id)?
        .ok_or_else(|| ShipyardError::NotFound(format!("crate with id {}", image_id)))?;
    let chain = layers::resolve(&ctx.db.crates(), &image.name)?;

    let tokens = split_command(command)?;
    if tokens.is_empty() {
        return Err(ShipyardError::Config(format!("ship '{}' has an empty command", name)));
    }

    let env = runtime_env(ctx, &image)?;

    let merge = mount_ship(&ctx.overlays, name, chain).await?;

    let spawned = spawn_detached(ctx.launcher.as_ref(), &merge, &env, &tokens, log_dir)
        .and_then(|child| match child.id() {
            Some(pid) => Ok((child, pid)),
            None => Err(ShipyardError::Spawn(format!("ship '{}' exited immediately", name))),
        });
    let (child, pid) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(ship = %name, error = %e, "Ship failed to spawn");
            if let Err(db_err) = ships.record_spawn_failure(name, image_id) {
                warn!(ship = %name, error = %db_err, "Failed to record spawn failure");
            }
            teardown_ship(&ctx.overlays, name).await;
            return Err(e);
        }
    };

    // Persist before supervising so an instant exit finds a running row.
    let persisted = match mode {
        Launch::Deploy => ships.insert_running(name, image_id, pid),
        Launch::Start => ships.update_running(name, image_id, pid),
    };
    if let Err(e) = persisted {
        warn!(ship = %name, pid, error = %e, "Failed to persist ship; killing it");
        if let Err(kill_err) = ctx.signals.kill(pid) {
            warn!(ship = %name, pid, error = %kill_err, "Failed to kill unpersisted ship");
        }
        teardown_ship(&ctx.overlays, name).await;
        return Err(e);
    }

    ctx.supervisor.attach(name, child).await?;
    info!(ship = %name, pid, crate_name = %image.name, mode = ?mode, "Ship running");
    Ok(Response::spawned(pid))
}

/// Work directory and environment from the crate's build file.
fn runtime_env(ctx: &DaemonContext, image: &CrateRecord) -> ShipyardResult<RootEnv> {
    match ctx.db.descriptors().get(image.descriptor_id)? {
        Some(descriptor) => Ok(BuildFile::parse(&descriptor.content)?.root_env()),
        None => {
            warn!(crate_name = %image.name, "Build file missing, running ship from /");
            Ok(RootEnv::default())
        }
    }
}

async fn stop(ctx: &DaemonContext, name: &str, force: bool) -> ShipyardResult<Response> {
    let record = ctx
        .db
        .ships()
        .get(name)?
        .ok_or_else(|| ShipyardError::NotFound(format!("ship '{}'", name)))?;

    let Some(pid) = record.pid().filter(|_| record.status().is_running()) else {
        return Ok(Response::success(format!("ship '{}' is not running", name)));
    };

    if ctx.signals.probe(pid) == Liveness::Dead {
        settle(ctx, name, pid).await?;
        return Ok(Response::success(format!("ship '{}' was already stopped", name)));
    }

    if ctx.signals.terminate(pid)? == Delivery::AlreadyGone {
        settle(ctx, name, pid).await?;
        return Ok(Response::success(format!("ship '{}' stopped", name)));
    }

    tokio::time::sleep(ctx.options.stop_grace_period).await;

    if ctx.signals.probe(pid) != Liveness::Dead {
        if !force {
            warn!(ship = %name, pid, "Ship ignored SIGTERM");
            return Err(ShipyardError::InvalidState(format!(
                "ship '{}' (pid {}) did not stop within {}s; retry with force",
                name,
                pid,
                ctx.options.stop_grace_period.as_secs_f32()
            )));
        }
        info!(ship = %name, pid, "Force killing ship");
        ctx.signals.kill(pid)?;
    }

    settle(ctx, name, pid).await?;
    Ok(Response::success(format!("ship '{}' stopped", name)))
}

/// Record a stop-initiated end of `pid`, then release its supervision and root.
async fn settle(ctx: &DaemonContext, name: &str, pid: u32) -> ShipyardResult<()> {
    let applied = ctx.db.ships().mark_stopped(name, pid, None)?;
    ctx.supervisor.detach(name, pid).await;
    teardown_ship(&ctx.overlays, name).await;
    info!(ship = %name, pid, applied, "Ship stopped");
    Ok(())
}
