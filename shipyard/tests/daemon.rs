//! Integration tests for the daemon: control protocol, supervision and
//! reconciliation, run in-process on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use shipyard::daemon::{Daemon, DaemonContext, DaemonState};
use shipyard::util::{Liveness, SignalSender, SystemSignals, read_pid_file};
use shipyard::{Request, Response, RootKind, ShipStatus, ShipyardError, ShipyardOptions, ShipyardRuntime};
use shipyard_shared::protocol::ResponseStatus;
use shipyard_test_utils::{
    HostLauncher, RecordingMounter, SentSignal, SpySignals, TestHome, wait_until,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ============================================================================
// HELPERS
// ============================================================================

const SETTLE: Duration = Duration::from_secs(5);

fn deploy(home: &TestHome, ship: &str, image_id: i64, command: &str) -> Request {
    Request::Deploy {
        ship_id: ship.to_string(),
        command: command.to_string(),
        log_dir: home.layout().log_dir(ship),
        image_id,
    }
}

fn stop(ship: &str, force: bool) -> Request {
    Request::Stop {
        ship_name: ship.to_string(),
        force,
    }
}

async fn raw_exchange(addr: std::net::SocketAddr, payload: &[u8]) -> Response {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    Response::from_wire(&buf).unwrap()
}

// ============================================================================
// DEPLOY AND LIVENESS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn deployed_ship_is_running_with_pid() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    let response = daemon
        .client
        .send(&deploy(&home, "web", image.id, "sleep 30"))
        .await
        .unwrap();
    assert!(response.is_success(), "{:?}", response);
    let pid = response.pid.unwrap();

    let ship = home.ship("web").unwrap();
    assert_eq!(ship.status(), ShipStatus::Running);
    assert_eq!(ship.pid(), Some(pid));
    assert_eq!(SystemSignals.probe(pid), Liveness::Alive);

    let merge = home.runtime().overlays().paths(RootKind::Ship, "web").merge;
    assert!(home.mounter().is_mounted(&merge));

    daemon.client.send(&stop("web", true)).await.unwrap();
    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ship_process_runs_in_merged_root() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    let response = daemon
        .client
        .send(&deploy(&home, "web", image.id, "sleep 30"))
        .await
        .unwrap();
    assert!(response.is_success(), "{:?}", response);

    let launches = daemon.launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].root, home.layout().overlay(RootKind::Ship, "web").merge);
    assert_eq!(launches[0].tokens, ["sleep", "30"]);

    daemon.client.send(&stop("web", true)).await.unwrap();
    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ship_gets_crate_workdir_and_environment() {
    let home = TestHome::new();
    let yaml = r#"
build_context:
  base_image: root
  work_directory: /srv
build_steps:
  - action: execute_command
    command: ["true"]
crate_config:
  environment_variables:
    GREETING: ahoy
runtime_command: ["true"]
"#;
    let image = home.build("greeter", yaml, &home.scratch()).unwrap();
    let daemon = home.start_daemon().await;

    daemon
        .client
        .send(&deploy(
            &home,
            "greeter",
            image.id,
            "sh -c 'echo $GREETING > greeting.txt; echo $GREETING'",
        ))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(
        wait_until(SETTLE, || {
            home.ship("greeter")
                .is_some_and(|s| s.status() == ShipStatus::Stopped)
        })
        .await
    );

    let launches = daemon.launcher.launches();
    let launch = &launches[0];
    assert_eq!(launch.workdir, "/srv");
    assert_eq!(launch.vars.get("GREETING").map(String::as_str), Some("ahoy"));

    let out = std::fs::read_to_string(home.layout().log_dir("greeter").join("out.log")).unwrap();
    assert_eq!(out, "ahoy\n");
    let upper = home.layout().overlay(RootKind::Ship, "greeter").upper;
    assert_eq!(std::fs::read_to_string(upper.join("srv/greeting.txt")).unwrap(), "ahoy\n");

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_deploys_of_one_name_leave_winner_mounted() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;
    let request = deploy(&home, "web", image.id, "sleep 30");

    let (a, b, c, d) = tokio::join!(
        daemon.client.send(&request),
        daemon.client.send(&request),
        daemon.client.send(&request),
        daemon.client.send(&request),
    );
    let responses = [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()];
    let winners: Vec<_> = responses.iter().filter(|r| r.is_success()).collect();
    assert_eq!(winners.len(), 1, "{:?}", responses);

    let ship = home.ship("web").unwrap();
    assert_eq!(ship.status(), ShipStatus::Running);
    assert_eq!(ship.pid(), winners[0].pid);
    assert_eq!(SystemSignals.probe(ship.pid().unwrap()), Liveness::Alive);

    let merge = home.layout().overlay(RootKind::Ship, "web").merge;
    assert!(home.mounter().is_mounted(&merge));
    assert_eq!(daemon.launcher.launches().len(), 1);

    daemon.client.send(&stop("web", true)).await.unwrap();
    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_ship_flips_to_stopped_without_explicit_stop() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    let pid = daemon
        .client
        .send(&deploy(&home, "web", image.id, "sleep 30"))
        .await
        .unwrap()
        .pid
        .unwrap();

    SystemSignals.kill(pid).unwrap();

    let stopped = wait_until(SETTLE, || {
        home.ship("web")
            .is_some_and(|s| s.status() == ShipStatus::Stopped)
    })
    .await;
    assert!(stopped);

    let ship = home.ship("web").unwrap();
    assert!(ship.state.stopped_at.is_some());
    assert_eq!(ship.pid(), None);
    assert!(daemon.signals.sent().is_empty());

    let merge = home.runtime().overlays().paths(RootKind::Ship, "web").merge;
    assert!(wait_until(SETTLE, || !home.mounter().is_mounted(&merge)).await);

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_code_recorded_on_normal_exit() {
    let home = TestHome::new();
    let image = home.build_layer("job", "root");
    let daemon = home.start_daemon().await;

    daemon
        .client
        .send(&deploy(&home, "job", image.id, "sh -c 'echo done; exit 7'"))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(
        wait_until(SETTLE, || {
            home.ship("job")
                .is_some_and(|s| s.status() == ShipStatus::Stopped)
        })
        .await
    );
    assert_eq!(home.ship("job").unwrap().state.exit_code, Some(7));

    let out = std::fs::read_to_string(home.layout().log_dir("job").join("out.log")).unwrap();
    assert_eq!(out, "done\n");

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deploy_with_missing_binary_marks_ship_error() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    let response = daemon
        .client
        .send(&deploy(&home, "web", image.id, "/no/such/binary"))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert!(response.message.unwrap().contains("spawn failed"));

    let ship = home.ship("web").unwrap();
    assert_eq!(ship.status(), ShipStatus::Error);
    assert_eq!(ship.pid(), None);

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deploying_twice_is_rejected_and_start_reuses_ship() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    daemon
        .client
        .send(&deploy(&home, "web", image.id, "true"))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(
        wait_until(SETTLE, || {
            home.ship("web")
                .is_some_and(|s| s.status() == ShipStatus::Stopped)
        })
        .await
    );

    let again = daemon
        .client
        .send(&deploy(&home, "web", image.id, "true"))
        .await
        .unwrap();
    assert!(!again.is_success());

    let started = daemon
        .client
        .send(&Request::Start {
            ship_name: "web".into(),
            command: "sleep 30".into(),
            log_dir: home.layout().log_dir("web"),
            image_id: image.id,
        })
        .await
        .unwrap();
    assert!(started.is_success(), "{:?}", started);
    assert_eq!(home.ship("web").unwrap().status(), ShipStatus::Running);

    daemon.client.send(&stop("web", true)).await.unwrap();
    daemon.stop().await.unwrap();
}

// ============================================================================
// STOP
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn stop_on_stopped_ship_sends_no_signal() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    daemon
        .client
        .send(&deploy(&home, "web", image.id, "true"))
        .await
        .unwrap();
    assert!(
        wait_until(SETTLE, || {
            home.ship("web")
                .is_some_and(|s| s.status() == ShipStatus::Stopped)
        })
        .await
    );

    let response = daemon.client.send(&stop("web", false)).await.unwrap();
    assert!(response.is_success());
    assert!(daemon.signals.sent().is_empty());

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_terminates_ship() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");
    let daemon = home.start_daemon().await;

    let pid = daemon
        .client
        .send(&deploy(&home, "web", image.id, "sleep 30"))
        .await
        .unwrap()
        .pid
        .unwrap();

    let response = daemon.client.send(&stop("web", false)).await.unwrap();
    assert!(response.is_success(), "{:?}", response);
    assert_eq!(daemon.signals.sent(), [(SentSignal::Term, pid)]);

    let ship = home.ship("web").unwrap();
    assert_eq!(ship.status(), ShipStatus::Stopped);
    assert!(ship.state.stopped_at.is_some());

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn term_ignoring_ship_needs_force() {
    let home = TestHome::new();
    let image = home.build_layer("stubborn", "root");
    let daemon = home.start_daemon().await;

    let pid = daemon
        .client
        .send(&deploy(
            &home,
            "stubborn",
            image.id,
            "sh -c 'trap \"\" TERM; while true; do sleep 1; done'",
        ))
        .await
        .unwrap()
        .pid
        .unwrap();
    // let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let refused = daemon.client.send(&stop("stubborn", false)).await.unwrap();
    assert_eq!(refused.status, ResponseStatus::Error);
    assert!(refused.message.unwrap().contains("retry with force"));
    assert_eq!(home.ship("stubborn").unwrap().status(), ShipStatus::Running);
    assert_eq!(SystemSignals.probe(pid), Liveness::Alive);

    let forced = daemon.client.send(&stop("stubborn", true)).await.unwrap();
    assert!(forced.is_success(), "{:?}", forced);
    assert_eq!(home.ship("stubborn").unwrap().status(), ShipStatus::Stopped);
    assert!(daemon.signals.sent().contains(&(SentSignal::Kill, pid)));

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_unknown_ship_is_error() {
    let home = TestHome::new();
    let daemon = home.start_daemon().await;

    let response = daemon.client.send(&stop("ghost", false)).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);

    daemon.stop().await.unwrap();
}

// ============================================================================
// PROTOCOL
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn malformed_payload_gets_error_reply() {
    let home = TestHome::new();
    let daemon = home.start_daemon().await;

    let garbage = raw_exchange(daemon.addr, b"{not json").await;
    assert_eq!(garbage.status, ResponseStatus::Error);

    let unknown = raw_exchange(daemon.addr, br#"{"type":"restart","shipName":"web"}"#).await;
    assert_eq!(unknown.status, ResponseStatus::Error);

    // still serving afterwards
    let response = daemon.client.send(&stop("ghost", false)).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Error);

    daemon.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_image_id_is_error() {
    let home = TestHome::new();
    let daemon = home.start_daemon().await;

    let response = daemon
        .client
        .send(&deploy(&home, "web", 4242, "sleep 30"))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert!(home.ship("web").is_none());

    daemon.stop().await.unwrap();
}

// ============================================================================
// DAEMON LIFECYCLE
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn pid_file_written_and_removed() {
    let home = TestHome::new();
    let pid_file = home.layout().pid_file();

    let daemon = home.start_daemon().await;
    assert_eq!(read_pid_file(&pid_file).unwrap(), std::process::id());

    daemon.stop().await.unwrap();
    assert!(!pid_file.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn occupied_address_fails_start_without_pid_file() {
    let temp = tempfile::TempDir::new().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut options = ShipyardOptions::with_home(temp.path().join("home"));
    options.daemon_addr = taken.local_addr().unwrap().to_string();
    let runtime = ShipyardRuntime::with_mounter(options, Arc::new(RecordingMounter::new())).unwrap();

    let (ctx, events) = DaemonContext::new(
        &runtime,
        Arc::new(HostLauncher::new()),
        Arc::new(SpySignals::new()),
    );
    let mut daemon = Daemon::new(ctx, events);

    let err = daemon.start().await.unwrap_err();
    assert!(matches!(err, ShipyardError::Config(_)), "got {err}");
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(!runtime.layout().pid_file().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_daemon_reconciles_dead_ship() {
    let home = TestHome::new();
    let image = home.build_layer("web", "root");

    let first = home.start_daemon().await;
    let pid = first
        .client
        .send(&deploy(&home, "web", image.id, "sleep 30"))
        .await
        .unwrap()
        .pid
        .unwrap();
    first.stop().await.unwrap();

    // ship outlives the daemon
    assert_eq!(SystemSignals.probe(pid), Liveness::Alive);
    assert_eq!(home.ship("web").unwrap().status(), ShipStatus::Running);

    SystemSignals.kill(pid).unwrap();
    // reap it: the child handle was dropped with the first daemon's supervisor
    assert!(wait_until(SETTLE, || SystemSignals.probe(pid) == Liveness::Dead).await);

    let second = home.start_daemon().await;
    let ship = home.ship("web").unwrap();
    assert_eq!(ship.status(), ShipStatus::Stopped);
    assert!(ship.state.stopped_at.is_some());

    second.stop().await.unwrap();
}
