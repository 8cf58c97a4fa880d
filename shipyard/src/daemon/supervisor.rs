//! Supervisor - per-ship exit waiters and liveness probes.
//!
//! Every process the daemon spawns gets a slot holding two background tasks:
//! a waiter that owns the child handle and reports its exit, and a probe
//! that checks the PID with signal 0 every `probe_interval` and reports a
//! process that vanished without an exit event. Ships adopted after a daemon
//! restart have no child handle and get only the probe.
//!
//! Tasks never touch the store themselves. They send an [`ExitEvent`] into a
//! channel drained by the daemon's event loop, which applies the transition
//! and detaches the slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use tokio::process::Child;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::util::process::exit_code_of;
use crate::util::{Liveness, SignalSender};

/// How a supervised process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The waiter reaped it with this exit code (`128 + signal` when signalled).
    Exited(i32),
    /// Waiting on the child failed.
    WaitFailed(String),
    /// The probe found the PID gone.
    Vanished,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitEvent {
    pub ship: String,
    pub pid: u32,
    pub outcome: ExitOutcome,
}

/// Per-ship supervision state.
struct ShipSlot {
    pid: u32,
    /// Only present for processes this daemon spawned.
    waiter: Option<JoinHandle<()>>,
    probe: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ShipSlot {
    fn shut_down(self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(waiter) = self.waiter {
            waiter.abort();
        }
        self.probe.abort();
    }
}

/// Maps ship name to its supervision tasks. Constructed at daemon start,
/// drained at daemon stop; cloning shares the same map.
#[derive(Clone)]
pub struct Supervisor {
    slots: Arc<RwLock<HashMap<String, ShipSlot>>>,
    signals: Arc<dyn SignalSender>,
    probe_interval: Duration,
    events: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its exit-event channel.
    pub fn new(
        signals: Arc<dyn SignalSender>,
        probe_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ExitEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            signals,
            probe_interval,
            events,
        };
        (supervisor, rx)
    }

    /// Supervise a freshly spawned child. Returns its PID.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn attach(&self, ship: &str, mut child: Child) -> ShipyardResult<u32> {
        let pid = child.id().ok_or_else(|| {
            ShipyardError::Spawn(format!("ship '{}' exited before it could be supervised", ship))
        })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let waiter = {
            let ship = ship.to_string();
            let events = self.events.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        let outcome = match status {
                            Ok(status) => ExitOutcome::Exited(exit_code_of(&status)),
                            Err(e) => ExitOutcome::WaitFailed(e.to_string()),
                        };
                        debug!(ship = %ship, pid, ?outcome, "Supervised process ended");
                        let _ = events.send(ExitEvent { ship, pid, outcome });
                    }
                    _ = shutdown.changed() => {
                        debug!(ship = %ship, pid, "Exit waiter detached");
                    }
                }
            })
        };

        let probe = self.spawn_probe(ship, pid, shutdown_rx);
        self.install(
            ship,
            ShipSlot {
                pid,
                waiter: Some(waiter),
                probe,
                shutdown_tx,
            },
        )
        .await;

        info!(ship = %ship, pid, "Supervising ship");
        Ok(pid)
    }

    /// Probe a PID this daemon did not spawn (adopted after a restart).
    pub async fn watch_pid(&self, ship: &str, pid: u32) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe = self.spawn_probe(ship, pid, shutdown_rx);
        self.install(
            ship,
            ShipSlot {
                pid,
                waiter: None,
                probe,
                shutdown_tx,
            },
        )
        .await;

        info!(ship = %ship, pid, "Watching adopted ship");
    }

    fn spawn_probe(&self, ship: &str, pid: u32, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let ship = ship.to_string();
        let events = self.events.clone();
        let signals = Arc::clone(&self.signals);
        let interval = self.probe_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if signals.probe(pid) == Liveness::Dead {
                            debug!(ship = %ship, pid, "Probe found process gone");
                            let _ = events.send(ExitEvent {
                                ship,
                                pid,
                                outcome: ExitOutcome::Vanished,
                            });
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!(ship = %ship, pid, "Probe shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn install(&self, ship: &str, slot: ShipSlot) {
        let mut slots = self.slots.write().await;
        if let Some(old) = slots.insert(ship.to_string(), slot) {
            warn!(ship = %ship, old_pid = old.pid, "Replacing existing supervision slot");
            old.shut_down();
        }
    }

    /// Stop supervising `ship` if its slot still belongs to `pid`.
    ///
    /// A slot installed for a newer process of the same ship is left alone.
    pub async fn detach(&self, ship: &str, pid: u32) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(ship) {
            Some(slot) if slot.pid == pid => {
                if let Some(slot) = slots.remove(ship) {
                    slot.shut_down();
                }
                debug!(ship = %ship, pid, "Supervision detached");
                true
            }
            _ => false,
        }
    }

    /// Drop every slot. Processes keep running; only supervision ends.
    pub async fn stop_all(&self) {
        let mut slots = self.slots.write().await;
        let count = slots.len();
        for (_, slot) in slots.drain() {
            slot.shut_down();
        }
        info!(count, "All ship supervisors stopped");
    }

    pub async fn is_supervising(&self, ship: &str) -> bool {
        self.slots.read().await.contains_key(ship)
    }

    /// PID currently supervised for `ship`.
    pub async fn pid_of(&self, ship: &str) -> Option<u32> {
        self.slots.read().await.get(ship).map(|slot| slot.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{Delivery, SystemSignals};
    use std::process::Stdio;

    fn supervisor(interval_ms: u64) -> (Supervisor, mpsc::UnboundedReceiver<ExitEvent>) {
        Supervisor::new(Arc::new(SystemSignals), Duration::from_millis(interval_ms))
    }

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let (sup, mut rx) = supervisor(60_000);
        let pid = sup.attach("web", sh("exit 3")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ExitEvent {
                ship: "web".into(),
                pid,
                outcome: ExitOutcome::Exited(3),
            }
        );
    }

    #[tokio::test]
    async fn test_killed_process_reports_signal_code() {
        let (sup, mut rx) = supervisor(60_000);
        let pid = sup.attach("web", sh("sleep 30")).await.unwrap();

        assert_eq!(SystemSignals.kill(pid).unwrap(), Delivery::Delivered);
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.outcome, ExitOutcome::Exited(137));
    }

    #[tokio::test]
    async fn test_probe_reports_vanished_adopted_pid() {
        let (sup, mut rx) = supervisor(20);
        sup.watch_pid("ghost", 999_999_999).await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.outcome, ExitOutcome::Vanished);
        assert_eq!(event.pid, 999_999_999);
    }

    #[tokio::test]
    async fn test_detach_only_matching_pid() {
        let (sup, _rx) = supervisor(60_000);
        let mut child = sh("sleep 30");
        let pid = child.id().unwrap();
        sup.watch_pid("web", pid).await;

        assert!(!sup.detach("web", pid + 1).await);
        assert!(sup.is_supervising("web").await);
        assert!(sup.detach("web", pid).await);
        assert!(!sup.is_supervising("web").await);

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_leaves_processes_running() {
        let (sup, mut rx) = supervisor(60_000);
        let pid = sup.attach("web", sh("sleep 30")).await.unwrap();

        sup.stop_all().await;
        assert!(!sup.is_supervising("web").await);
        assert_eq!(SystemSignals.probe(pid), Liveness::Alive);

        // no event once detached
        SystemSignals.kill(pid).unwrap();
        let next = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(next, Ok(Some(_))));
    }
}
