//! Daemon lifecycle and the control socket accept loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use shipyard_shared::protocol::{MAX_MESSAGE_BYTES, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconcile::reconcile;
use super::{DaemonContext, ExitEvent, handle, run_event_loop};
use crate::util::{PidFileStatus, pid_file_status, remove_pid_file, write_pid_file};

/// A client has this long to send its full request.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon lifecycle.
///
/// ```text
/// Stopped ──start()──► Starting ──► Running ──signal / cancel──► Stopping ──► Stopped
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    /// Binding, writing the PID file, first reconciliation.
    Starting,
    Running,
    /// Draining connections and removing the PID file.
    Stopping,
}

pub struct Daemon {
    ctx: DaemonContext,
    state: DaemonState,
    pid_file: PathBuf,
    listener: Option<TcpListener>,
    events: Option<mpsc::UnboundedReceiver<ExitEvent>>,
    event_loop: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(ctx: DaemonContext, events: mpsc::UnboundedReceiver<ExitEvent>) -> Self {
        let pid_file = ctx.overlays.layout().pid_file();
        Self {
            ctx,
            state: DaemonState::Stopped,
            pid_file,
            listener: None,
            events: Some(events),
            event_loop: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Cancelling this token stops [`Daemon::run`] like SIGTERM does.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    fn transition(&mut self, next: DaemonState) {
        info!(from = ?self.state, to = ?next, "Daemon state transition");
        self.state = next;
    }

    /// Bind the control socket, write the PID file and reconcile once.
    ///
    /// Refuses to start while another live daemon owns the PID file. A PID
    /// file left behind by a dead daemon is overwritten.
    pub async fn start(&mut self) -> ShipyardResult<SocketAddr> {
        if self.state != DaemonState::Stopped {
            return Err(ShipyardError::InvalidState(format!(
                "daemon is {:?}, expected Stopped",
                self.state
            )));
        }
        self.transition(DaemonState::Starting);

        let own_pid = std::process::id();
        match pid_file_status(&self.pid_file) {
            PidFileStatus::Live(pid) if pid != own_pid => {
                self.transition(DaemonState::Stopped);
                return Err(ShipyardError::AlreadyExists(format!(
                    "daemon already running with pid {} ({})",
                    pid,
                    self.pid_file.display()
                )));
            }
            PidFileStatus::Stale(pid) => {
                let stale = ShipyardError::StaleState(format!(
                    "PID file {} points at dead pid {:?}",
                    self.pid_file.display(),
                    pid
                ));
                warn!(error = %stale, "Overwriting stale PID file");
            }
            _ => {}
        }

        let listener = match TcpListener::bind(&self.ctx.options.daemon_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.transition(DaemonState::Stopped);
                return Err(ShipyardError::Config(format!(
                    "failed to bind {}: {}",
                    self.ctx.options.daemon_addr, e
                )));
            }
        };
        // the PID file announces a daemon that is already reachable
        if let Err(e) = write_pid_file(&self.pid_file, own_pid) {
            self.transition(DaemonState::Stopped);
            return Err(e);
        }
        let addr = listener.local_addr()?;
        self.listener = Some(listener);

        match reconcile(&self.ctx).await {
            Ok(report) => info!(
                checked = report.checked,
                stopped = report.stopped,
                adopted = report.adopted,
                "Startup reconciliation done"
            ),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }

        if let Some(events) = self.events.take() {
            self.event_loop = Some(tokio::spawn(run_event_loop(self.ctx.clone(), events)));
        }

        self.transition(DaemonState::Running);
        info!(%addr, pid = own_pid, "Daemon listening");
        Ok(addr)
    }

    /// Serve until SIGINT, SIGTERM or the shutdown token, then drain.
    pub async fn run(mut self) -> ShipyardResult<()> {
        let Some(listener) = self.listener.take() else {
            return Err(ShipyardError::InvalidState(
                "daemon must be started before it runs".into(),
            ));
        };

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let period = self.ctx.options.reconcile_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = reconcile(&self.ctx).await {
                        warn!(error = %e, "Reconciliation failed");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let ctx = self.ctx.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(&ctx, stream).await {
                                warn!(%peer, error = %e, "Connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        self.transition(DaemonState::Stopping);
        drop(listener);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending = connections.len(), "Aborting in-flight requests");
            connections.abort_all();
        }

        self.ctx.supervisor.stop_all().await;
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.abort();
        }

        remove_pid_file(&self.pid_file)?;
        self.transition(DaemonState::Stopped);
        Ok(())
    }
}

/// Read one request to EOF, dispatch it, write one response.
async fn serve_connection(ctx: &DaemonContext, mut stream: TcpStream) -> ShipyardResult<()> {
    let mut buf = Vec::new();
    let read = tokio::time::timeout(
        REQUEST_READ_TIMEOUT,
        (&mut stream)
            .take(MAX_MESSAGE_BYTES as u64 + 1)
            .read_to_end(&mut buf),
    )
    .await;

    let response = match read {
        Err(_) => Response::error("timed out reading request"),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) if buf.len() > MAX_MESSAGE_BYTES => {
            Response::error(format!("request exceeds {} bytes", MAX_MESSAGE_BYTES))
        }
        Ok(Ok(_)) => match Request::from_wire(&buf) {
            Ok(request) => {
                debug!(request = request.kind(), ship = request.ship_name(), "Dispatching request");
                handle(ctx, request).await
            }
            Err(e) => {
                warn!(error = %e, "Rejected malformed request");
                Response::error(e.to_string())
            }
        },
    };

    stream.write_all(&response.to_wire()?).await?;
    stream.shutdown().await?;
    Ok(())
}
