//! Per-bin serialization through the router while storage is slow or failing.

mod common;

use std::time::Duration;

use binwatch_core::{
    ActuatorOutcome, AlertSeverity, BinId, BinStatus, CommandStatus, StepReport, Topics,
};
use common::{Harness, ack_message, at, committed_status, fill_message};
use tokio::time::timeout;

const PATIENCE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn sweep_during_a_failing_commit_publishes_nothing() {
    let (harness, gate) = Harness::gated().await;
    let bin = BinId::new("B1");
    harness.fill("B1", 1, 72.0, 0).await;

    gate.fail_commits(true);
    gate.hold("B1");
    let receipt = harness
        .router
        .handle_message(&fill_message("B1", 2, 95.0, 10), at(10))
        .await
        .expect("queued");
    gate.reached().await;

    let sweep = harness.router.sweep(at(11)).await;
    assert_eq!(sweep.publish_retries, 0, "an uncommitted command is invisible to the sweep");
    gate.release();

    let report = receipt.wait().await.expect("step finished");
    assert!(matches!(report, StepReport::RolledBack(_)), "got {report:?}");
    harness.settle("B1", 12).await;

    assert!(harness.bus.published_on(&Topics::command(&bin)).await.is_empty());
    assert!(harness.store.all_commands().is_empty());
    assert_eq!(
        harness.router.bin_state(&bin).map(|state| state.status),
        Some(BinStatus::Warning)
    );
}

#[tokio::test]
async fn timeout_queued_behind_an_ack_finds_nothing_to_expire() {
    let (harness, gate) = Harness::gated().await;
    let bin = BinId::new("B1");
    harness.fill("B1", 1, 72.0, 0).await;
    let report = harness.fill("B1", 2, 95.0, 10).await;
    let StepReport::Committed {
        command: Some(command),
        ..
    } = report
    else {
        panic!("expected a command, got {report:?}");
    };

    gate.hold("B1");
    let ack = harness
        .router
        .handle_message(
            &ack_message("B1", command.command_id, ActuatorOutcome::Done),
            at(45),
        )
        .await
        .expect("queued");
    gate.reached().await;

    // Published at t=10, so the command looks overdue while the ack is in flight.
    let sweep = harness.router.sweep(at(45)).await;
    assert_eq!(sweep.timeouts, 1);
    gate.release();

    let acked = ack.wait().await.expect("ack handled");
    assert_eq!(committed_status(&acked), Some(BinStatus::Normal));
    harness.settle("B1", 46).await;

    let state = harness.router.bin_state(&bin).expect("state");
    assert_eq!(state.status, BinStatus::Normal);
    assert_eq!(state.failed_attempts, 0, "the timeout never applied");
    let statuses: Vec<CommandStatus> = harness
        .store
        .all_commands()
        .iter()
        .map(|record| record.status)
        .collect();
    assert_eq!(statuses, vec![CommandStatus::Acknowledged]);
}

#[tokio::test]
async fn staleness_check_queued_behind_a_reading_sees_it() {
    let (harness, gate) = Harness::gated().await;
    let bin = BinId::new("B1");
    harness.fill("B1", 1, 40.0, 0).await;

    gate.hold("B1");
    let receipt = harness
        .router
        .handle_message(&fill_message("B1", 2, 45.0, 400), at(400))
        .await
        .expect("queued");
    gate.reached().await;

    let sweep = harness.router.sweep(at(400)).await;
    assert_eq!(sweep.stale, 1, "the committed state is still silent since t=0");
    gate.release();

    let report = receipt.wait().await.expect("reading handled");
    assert_eq!(committed_status(&report), Some(BinStatus::Normal));
    harness.settle("B1", 401).await;

    assert_eq!(
        harness.router.bin_state(&bin).map(|state| state.status),
        Some(BinStatus::Normal)
    );
    assert!(
        harness
            .store
            .all_alerts()
            .iter()
            .all(|alert| alert.severity != AlertSeverity::Offline)
    );
}

#[tokio::test]
async fn a_stalled_bin_does_not_hold_up_others() {
    let (harness, gate) = Harness::gated().await;

    gate.hold("B1");
    let stalled = harness
        .router
        .handle_message(&fill_message("B1", 1, 40.0, 0), at(0))
        .await
        .expect("queued");
    gate.reached().await;

    let other = timeout(PATIENCE, harness.fill("B2", 1, 40.0, 0))
        .await
        .expect("B2 proceeds while B1 is stalled");
    assert_eq!(committed_status(&other), Some(BinStatus::Normal));
    assert_eq!(harness.router.bin_state(&BinId::new("B1")), None, "B1 has not committed");

    gate.release();
    let report = stalled.wait().await.expect("B1 handled");
    assert_eq!(committed_status(&report), Some(BinStatus::Normal));
}
