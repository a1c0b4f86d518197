//! Fleet-level behavior against simulated controllers and worker hosts.

mod common;

use common::{router_ip, test_settings, Harness, SETTLE};
use daq_fleet::client::mock::Completion;
use daq_fleet::device::{DeviceState, OverallState, Operation, TargetState};
use daq_fleet::dispatch::{TaskKind, TaskOutcome};
use daq_fleet::error::{DaqError, TimeoutKind};
use daq_fleet::fleet::Submission;
use daq_fleet::worker::mock::WorkerCall;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

#[tokio::test]
async fn test_single_transition_only_sets_transitioning() {
    let h = Harness::new(1, 1, DeviceState::Idle);
    let id = h.devices[0];

    h.fleet
        .orchestrator()
        .transition_one(id, DeviceState::Described)
        .await
        .unwrap();

    let device = h.device(0);
    assert_eq!(device.state, DeviceState::Idle);
    assert!(device.transitioning);
    assert_eq!(h.client(0).operations(), vec![Operation::Describe]);

    let (_, config_xml, datalink_xml) = h.client(0).calls().remove(0);
    assert!(config_xml.contains(r#"<SubConfigId type="describe">cobo</SubConfigId>"#));
    assert!(datalink_xml.contains(r#"<DataSender id="CoBo[0]"/>"#));

    let state = h.fleet.orchestrator().reconcile(id).await.unwrap();
    assert_eq!(state, DeviceState::Described);
    assert!(!h.device(0).transitioning);
}

#[tokio::test]
async fn test_dirty_staging_area_blocks_running() {
    let h = Harness::new(3, 2, DeviceState::Ready);
    h.store
        .update_router(h.routers[1], |r| r.staging_clean = false)
        .unwrap();

    let err = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::NotReady(_)));
    assert!(err.to_string().contains("router-1"));

    h.settle().await;
    for i in 0..3 {
        assert!(h.client(i).operations().is_empty());
        assert!(!h.device(i).transitioning);
    }
    assert!(!h.store.is_running(h.experiment));
}

#[tokio::test]
async fn test_one_refusal_does_not_stop_the_batch() {
    let h = Harness::new(3, 1, DeviceState::Ready);
    h.client(1)
        .fail_operation(Operation::Start, 12, "CoBo[1] not ready");

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Running))
        .await
        .unwrap();

    assert_eq!(result.submissions.len(), 3);
    assert_eq!(result.queued(), 3);
    assert_eq!(result.run_started.as_ref().map(|r| r.run_number), Some(0));
    assert!(h.store.is_running(h.experiment));

    h.settle().await;
    for i in 0..3 {
        assert_eq!(h.client(i).operations(), vec![Operation::Start]);
        assert_eq!(h.device(i).state, DeviceState::Ready);
    }
    assert!(h.device(0).transitioning);
    assert!(!h.device(1).transitioning);
    assert!(h.device(2).transitioning);
    assert_eq!(h.store.runs_for(h.experiment).len(), 1);
}

#[tokio::test]
async fn test_stopping_a_run_queues_post_run_jobs() {
    let h = Harness::new(3, 2, DeviceState::Running);
    let run = h.store.start_run(h.experiment).unwrap();

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Ready))
        .await
        .unwrap();

    let stopped = result.run_stopped.unwrap();
    assert_eq!(stopped.id, run.id);
    assert!(stopped.stop.is_some());
    assert!(!h.store.is_running(h.experiment));

    h.settle().await;
    let calls = h.workers.calls();
    let mut organized: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            WorkerCall::Organize {
                host,
                experiment,
                run_number,
            } => Some((*host, experiment.clone(), *run_number)),
            _ => None,
        })
        .collect();
    organized.sort();
    assert_eq!(
        organized,
        vec![
            (router_ip(0), "e15503".to_string(), 0),
            (router_ip(1), "e15503".to_string(), 0),
        ]
    );

    let backups = calls
        .iter()
        .filter(|c| matches!(c, WorkerCall::Backup { run_number: 0, .. }))
        .count();
    assert_eq!(backups, 3);
    for i in 0..3 {
        assert_eq!(h.client(i).operations(), vec![Operation::Stop]);
    }
}

#[tokio::test]
async fn test_reset_steps_each_device_back_from_its_own_state() {
    let h = Harness::new(3, 1, DeviceState::Idle);
    let states = [DeviceState::Running, DeviceState::Prepared, DeviceState::Described];
    for (i, state) in states.into_iter().enumerate() {
        h.store.update_device(h.devices[i], |d| d.state = state).unwrap();
        h.client(i).force_state(state, false);
    }

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::Reset)
        .await
        .unwrap();

    let targets: Vec<_> = result.submissions.iter().map(|s| s.target).collect();
    assert_eq!(
        targets,
        vec![DeviceState::Ready, DeviceState::Described, DeviceState::Idle]
    );
    assert!(result.run_started.is_none());
    assert!(result.run_stopped.is_none());

    h.settle().await;
    assert_eq!(h.client(0).operations(), vec![Operation::Stop]);
    assert_eq!(h.client(1).operations(), vec![Operation::Undo]);
    assert_eq!(h.client(2).operations(), vec![Operation::Undo]);
}

#[tokio::test]
async fn test_invalid_targets_are_rejected_per_device() {
    let h = Harness::new(2, 1, DeviceState::Idle);
    h.store
        .update_device(h.devices[1], |d| d.selected_config = None)
        .unwrap();

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Described))
        .await
        .unwrap();
    assert_eq!(result.queued(), 1);
    assert!(matches!(
        &result.submissions[1].submission,
        Submission::Rejected { error } if error.contains("No configuration selected")
    ));
    assert!(!h.device(1).transitioning);

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Ready))
        .await
        .unwrap();
    assert_eq!(result.queued(), 0);
    h.settle().await;
    assert!(h.client(1).operations().is_empty());
}

#[tokio::test]
async fn test_aggregate_state_is_unanimous_or_mixed() {
    let h = Harness::new(2, 1, DeviceState::Idle);
    assert_eq!(
        h.fleet.aggregate_state(h.experiment).unwrap(),
        OverallState::Unanimous(DeviceState::Idle)
    );

    h.store
        .update_device(h.devices[1], |d| d.state = DeviceState::Described)
        .unwrap();
    assert_eq!(h.fleet.aggregate_state(h.experiment).unwrap(), OverallState::Mixed);

    let empty = h.store.add_experiment("empty").unwrap();
    assert_eq!(h.fleet.aggregate_state(empty).unwrap(), OverallState::Mixed);

    let status = h.fleet.status(h.experiment).unwrap();
    assert_eq!(status.overall_state, None);
    assert_eq!(status.overall_state_name, "Mixed");
}

#[tokio::test]
async fn test_watchdog_clears_stuck_transition() {
    let h = Harness::new(1, 1, DeviceState::Idle);
    let id = h.devices[0];
    h.fleet
        .orchestrator()
        .transition_one(id, DeviceState::Described)
        .await
        .unwrap();
    h.client(0).set_unreachable(true);

    for _ in 0..2 {
        assert!(h.fleet.orchestrator().reconcile(id).await.is_err());
    }
    let device = h.device(0);
    assert_eq!(device.failed_polls, 2);
    assert!(device.transitioning);

    assert!(h.fleet.orchestrator().reconcile(id).await.is_err());
    let device = h.device(0);
    assert!(!device.transitioning);
    assert!(!device.online);

    h.client(0).set_unreachable(false);
    assert_eq!(
        h.fleet.orchestrator().reconcile(id).await.unwrap(),
        DeviceState::Described
    );
    assert_eq!(h.device(0).failed_polls, 0);
}

#[tokio::test]
async fn test_slow_poll_counts_as_failed() {
    let h = Harness::new(1, 1, DeviceState::Idle);
    h.client(0).set_latency(Some(Duration::from_secs(2)));

    let err = h
        .fleet
        .orchestrator()
        .reconcile(h.devices[0])
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::RemoteTimeout(TimeoutKind::Soft)));
    assert_eq!(h.device(0).failed_polls, 1);
}

#[tokio::test]
async fn test_remote_timeout_leaves_transitioning_set() {
    let h = Harness::new(1, 1, DeviceState::Idle);
    h.client(0).set_latency(Some(Duration::from_secs(2)));
    let mut reports = h.fleet.dispatcher().subscribe();

    h.fleet
        .orchestrator()
        .request_transition(h.devices[0], TargetState::State(DeviceState::Described))
        .await
        .unwrap();
    h.settle().await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report.kind, TaskKind::Transition);
    assert_eq!(report.outcome, TaskOutcome::TimedOut(TimeoutKind::Soft));
    assert!(h.device(0).transitioning);
}

#[tokio::test]
async fn test_reconciliation_loop_converges() {
    let h = Harness::new(3, 1, DeviceState::Idle);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fleet = h.fleet.clone();
    let handle = tokio::spawn(async move { fleet.run_reconciliation(shutdown_rx).await });

    h.fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Described))
        .await
        .unwrap();

    let deadline = Instant::now() + SETTLE;
    loop {
        let devices = h.store.devices_in(h.experiment);
        if devices
            .iter()
            .all(|d| d.state == DeviceState::Described && !d.transitioning)
        {
            break;
        }
        assert!(Instant::now() < deadline, "fleet did not converge");
        sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(SETTLE, handle).await.unwrap().unwrap();
    h.settle().await;
    assert!(h.device(0).online);
    assert!(h.store.router(h.routers[0]).unwrap().online);
}

#[tokio::test]
async fn test_never_completing_device_stays_transitioning() {
    let h = Harness::with_settings(1, 1, DeviceState::Idle, Completion::Never, test_settings());
    let id = h.devices[0];
    h.fleet
        .orchestrator()
        .transition_one(id, DeviceState::Described)
        .await
        .unwrap();

    // The controller keeps answering "transitioning", which is a successful poll.
    h.reconcile_all().await;
    let device = h.device(0);
    assert!(device.transitioning);
    assert_eq!(device.state, DeviceState::Idle);
    assert_eq!(device.failed_polls, 0);
}
