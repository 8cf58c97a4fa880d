pub mod process;

use std::path::{Path, PathBuf};

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub use process::{
    Delivery, Liveness, PidFileStatus, SignalSender, SystemSignals, pid_file_status, probe,
    read_pid_file, remove_pid_file, write_pid_file,
};

/// Find a companion binary (e.g. `shipyardd`) next to the running executable,
/// or in `SHIPYARD_RUNTIME_DIR`.
pub fn find_binary(binary_name: &str) -> ShipyardResult<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(runtime_dir) = std::env::var("SHIPYARD_RUNTIME_DIR") {
        candidates.push(PathBuf::from(runtime_dir).join(binary_name));
    }

    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        candidates.push(dir.join(binary_name));
        // cargo test puts test binaries in target/*/deps
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(binary_name));
        }
    }

    for candidate in &candidates {
        tracing::debug!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if candidate.exists() {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ShipyardError::NotFound(format!(
        "Binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// Initialize file logging for the daemon.
///
/// Logs go to `{logs_dir}/{file_name}` with daily rotation. The returned guard
/// must be held for as long as logs should be flushed.
pub fn init_file_logging(logs_dir: &Path, file_name: &str) -> ShipyardResult<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        ShipyardError::Storage(format!(
            "failed to create logs dir {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    register_to_tracing(non_blocking, env_filter);

    Ok(guard)
}

/// Terminal width in columns, 80 when not attached to a terminal.
pub fn terminal_width() -> usize {
    term_size::dimensions().map(|(cols, _)| cols).unwrap_or(80)
}
