//! Gateway lifecycle tests against an in-memory process table.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use sandkeep::gateway::{
    GatewayError, GatewayState, HalfStartedPolicy, ProcessStartFailure, ProcessStatus,
    ProcessRegistry, WaitOptions,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::{FakeProbe, FakeRegistry, StartBehavior, gateway_manager, is_port_in_use};

fn fast() -> WaitOptions {
    WaitOptions::new(Duration::from_secs(2), Duration::from_millis(20))
}

#[tokio::test]
async fn test_concurrent_ensure_starts_one_process() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);
    let cancel = CancellationToken::new();

    let results = join_all((0..8).map(|_| manager.ensure_running(&cancel))).await;

    let pids: Vec<u32> = results.into_iter().map(|r| r.unwrap().pid).collect();
    assert!(pids.iter().all(|pid| *pid == pids[0]));
    assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
    assert_eq!(registry.running(), vec![pids[0]]);
    assert_eq!(manager.state(), GatewayState::Ready);
}

#[tokio::test]
async fn test_ensure_reuses_ready_process() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);
    let cancel = CancellationToken::new();

    let first = manager.ensure_running(&cancel).await.unwrap();
    let second = manager.ensure_running(&cancel).await.unwrap();

    assert_eq!(first.pid, second.pid);
    assert!(!second.adopted);
    assert_eq!(registry.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_adopts_externally_started_gateway() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let external = registry.spawn_external(true);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);

    let process = manager.ensure_running(&CancellationToken::new()).await.unwrap();

    assert_eq!(process.pid, external);
    assert!(process.adopted);
    assert_eq!(process.state, GatewayState::Ready);
    assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_restarts_after_crash() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);
    let cancel = CancellationToken::new();

    let first = manager.ensure_running(&cancel).await.unwrap();
    registry.crash(first.pid);

    let snapshot = manager.refresh().await;
    assert_eq!(snapshot.state, GatewayState::Crashed);

    let second = manager.ensure_running(&cancel).await.unwrap();
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.state, GatewayState::Ready);
    assert_eq!(manager.snapshot().starts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_is_bounded() {
    let registry = FakeRegistry::new(StartBehavior::Silent);
    let probe = FakeProbe::new(registry.clone());
    let startup = WaitOptions::new(Duration::from_secs(2), Duration::from_millis(250));
    let manager = gateway_manager(registry.clone(), probe.clone(), startup, HalfStartedPolicy::Wait);

    let started = tokio::time::Instant::now();
    let err = manager
        .ensure_running(&CancellationToken::new())
        .await
        .unwrap_err();
    let waited = started.elapsed();

    match err {
        GatewayError::ReadinessTimeout { pid, timeout } => {
            assert!(pid.is_some());
            assert!(timeout >= Duration::from_secs(2));
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(3));
    assert_eq!(manager.state(), GatewayState::Unready);
    assert!(probe.probes.load(Ordering::SeqCst) >= 8);
}

#[tokio::test(start_paused = true)]
async fn test_half_started_wait_adopts_when_it_answers() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let external = registry.spawn_external(false);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);

    let waker = registry.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        waker.set_answering(external, true);
    });

    let process = manager.ensure_running(&CancellationToken::new()).await.unwrap();
    assert_eq!(process.pid, external);
    assert!(process.adopted);
    assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_started_wait_times_out_without_second_start() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let external = registry.spawn_external(false);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);

    let err = manager
        .ensure_running(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GatewayError::ReadinessTimeout { pid: Some(pid), .. } if pid == external
    ));
    assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
    assert_eq!(registry.running(), vec![external]);
}

#[tokio::test]
async fn test_half_started_restart_replaces_process() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    let external = registry.spawn_external(false);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Restart);

    let process = manager.ensure_running(&CancellationToken::new()).await.unwrap();

    assert_ne!(process.pid, external);
    assert!(!process.adopted);
    assert_eq!(*registry.terminated.lock().unwrap(), vec![external]);
    assert!(matches!(
        registry.status(external).await,
        ProcessStatus::Exited { .. }
    ));
    assert_eq!(registry.running(), vec![process.pid]);
}

#[tokio::test]
async fn test_port_in_use_fails_fast() {
    let registry = FakeRegistry::new(StartBehavior::Healthy);
    *registry.port_holder.lock().unwrap() = Some("python3 (pid 77)".to_string());
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);

    let err = manager
        .ensure_running(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(is_port_in_use(&err));
    assert_eq!(err.code(), "process_start_failed");
    assert!(err.to_string().contains("python3 (pid 77)"));
    assert_eq!(registry.starts.load(Ordering::SeqCst), 0);
    assert_eq!(manager.state(), GatewayState::NotStarted);
}

#[tokio::test]
async fn test_early_exit_reports_output() {
    let registry = FakeRegistry::new(StartBehavior::ExitImmediately);
    let probe = FakeProbe::new(registry.clone());
    let manager = gateway_manager(registry.clone(), probe, fast(), HalfStartedPolicy::Wait);

    let err = manager
        .ensure_running(&CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        GatewayError::ProcessStart(ProcessStartFailure::ExitedEarly { status, output }) => {
            assert_eq!(status, "exited with code 1");
            assert_eq!(output, vec!["Error: invalid config".to_string()]);
        }
        other => panic!("expected early exit, got {other:?}"),
    }
    assert_eq!(manager.state(), GatewayState::Crashed);
}

#[tokio::test]
async fn test_cancel_stops_waiting() {
    let registry = FakeRegistry::new(StartBehavior::Silent);
    let probe = FakeProbe::new(registry.clone());
    let startup = WaitOptions::new(Duration::from_secs(60), Duration::from_millis(20));
    let manager = gateway_manager(registry.clone(), probe, startup, HalfStartedPolicy::Wait);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), manager.ensure_running(&cancel))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, GatewayError::ReadinessTimeout { .. }));
}
