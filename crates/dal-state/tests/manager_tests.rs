//! Workflow manager lifecycle and request serialization.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dal_core::constants::SIMULATOR_SERIAL_NUMBER;
use dal_core::{DalRequest, DeviceAction, DeviceErrorCode};
use dal_hardware::{DeviceOperation, EventPublisher, SimulatedBehavior, SimulatorDevice};
use dal_state::{ManagerState, SubWorkflowState, WorkflowManager};

use common::{SECOND_SERIAL, manager, manager_config, second_simulator_config};

async fn wait_for_state(manager: &WorkflowManager, state: ManagerState) {
    let mut states = manager.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_launch_discovers_and_serves_requests() {
    let (manager, handle) = manager();
    assert_eq!(manager.state(), ManagerState::Undefined);

    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;
    let devices = manager.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].serial_number, SIMULATOR_SERIAL_NUMBER);

    let envelope = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
        .await
        .unwrap();
    assert!(!envelope.request.has_errors());
    assert_eq!(
        envelope.request.primary_response().unwrap().devices.len(),
        1
    );
    assert_eq!(
        handle.calls(),
        vec![DeviceOperation::Probe, DeviceOperation::GetStatus]
    );
    assert_eq!(manager.snapshots().borrow().state, SubWorkflowState::RequestComplete);

    manager.stop_workflow().await;
    assert_eq!(manager.state(), ManagerState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_requests_run_in_arrival_order() {
    let (manager, handle) = manager();
    handle.set_behavior(DeviceOperation::ManualCardEntry, SimulatedBehavior::Hang);
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;
    let manager = Arc::new(manager);

    let token = CancellationToken::new();
    let first = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move {
            manager
                .set_workflow_with_token(
                    DalRequest::for_action(DeviceAction::ManualCardEntry),
                    token,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ManagerState::SubWorkflowIdle);

    let second = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!second.is_finished());
    assert_eq!(handle.call_count(DeviceOperation::GetStatus), 0);

    token.cancel();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    let codes: Vec<_> = first.request.errors().map(|e| e.code).collect();
    assert_eq!(codes, vec![DeviceErrorCode::CancelRequested]);
    assert!(!second.request.has_errors());
    assert_eq!(
        handle.calls(),
        vec![
            DeviceOperation::Probe,
            DeviceOperation::ManualCardEntry,
            DeviceOperation::DeviceSetIdle,
            DeviceOperation::DeviceRecovery,
            DeviceOperation::GetStatus,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_running_request() {
    let (manager, handle) = manager();
    handle.set_behavior(DeviceOperation::GetZip, SimulatedBehavior::Hang);
    manager.launch_workflow().unwrap();
    let manager = Arc::new(manager);

    let running = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .set_workflow(DalRequest::for_action(DeviceAction::GetZip))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.stop_workflow().await;
    let envelope = running.await.unwrap().unwrap();
    let codes: Vec<_> = envelope.request.errors().map(|e| e.code).collect();
    assert_eq!(codes, vec![DeviceErrorCode::CancelRequested]);

    assert_eq!(manager.state(), ManagerState::Shutdown);
    let err = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
        .await
        .unwrap_err();
    assert!(err.is_manager_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_orders_by_sort_order_and_skips_failures() {
    let (first, _first_handle) = SimulatorDevice::new();
    let (second, _second_handle) =
        SimulatorDevice::with_config(second_simulator_config(), EventPublisher::disabled());
    let (broken, broken_handle) = SimulatorDevice::new();
    broken_handle.set_behavior(DeviceOperation::Probe, SimulatedBehavior::Fail);

    let manager = WorkflowManager::builder(manager_config())
        .with_device(first)
        .with_device(broken)
        .with_device(second)
        .build();
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;

    let serials: Vec<_> = manager
        .devices()
        .into_iter()
        .map(|info| info.serial_number)
        .collect();
    assert_eq!(serials, vec![SECOND_SERIAL.to_string(), SIMULATOR_SERIAL_NUMBER.to_string()]);
    manager.stop_workflow().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_devices_reports_not_found() {
    let manager = WorkflowManager::builder(manager_config()).build();
    manager.launch_workflow().unwrap();

    let envelope = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetZip))
        .await
        .unwrap();
    let codes: Vec<_> = envelope.request.errors().map(|e| e.code).collect();
    assert_eq!(codes, vec![DeviceErrorCode::DeviceNotFound]);
    manager.stop_workflow().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reprobes_lost_device() {
    let (manager, handle) = manager();
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;

    handle.set_connected(false);
    tokio::time::sleep(Duration::from_millis(5_500)).await;

    wait_for_state(&manager, ManagerState::Manage).await;
    assert_eq!(handle.call_count(DeviceOperation::Probe), 2);
    assert!(handle.is_connected());

    let envelope = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
        .await
        .unwrap();
    assert!(!envelope.request.has_errors());
    assert_eq!(handle.call_count(DeviceOperation::GetStatus), 1);
    manager.stop_workflow().await;
}

#[tokio::test(start_paused = true)]
async fn test_absent_candidate_joins_on_health_tick() {
    let (first, _first_handle) = SimulatorDevice::new();
    let (late, late_handle) =
        SimulatorDevice::with_config(second_simulator_config(), EventPublisher::disabled());
    late_handle.set_behavior(DeviceOperation::Probe, SimulatedBehavior::Fail);

    let manager = WorkflowManager::builder(manager_config())
        .with_device(first)
        .with_device(late)
        .build();
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;
    assert_eq!(manager.devices().len(), 1);

    late_handle.reset_behaviors();
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    wait_for_state(&manager, ManagerState::Manage).await;

    let serials: Vec<_> = manager
        .devices()
        .into_iter()
        .map(|info| info.serial_number)
        .collect();
    assert_eq!(serials, vec![SECOND_SERIAL.to_string(), SIMULATOR_SERIAL_NUMBER.to_string()]);
    assert_eq!(late_handle.call_count(DeviceOperation::Probe), 2);

    let envelope = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
        .await
        .unwrap();
    assert_eq!(envelope.request.primary_response().unwrap().devices.len(), 2);
    manager.stop_workflow().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_cancels_its_request() {
    let (manager, handle) = manager();
    handle.set_behavior(DeviceOperation::GetZip, SimulatedBehavior::Hang);
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;
    let manager = Arc::new(manager);

    let caller = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .set_workflow(DalRequest::for_action(DeviceAction::GetZip))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ManagerState::SubWorkflowIdle);

    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    // Well inside the GetZip timeout.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.state(), ManagerState::Manage);
    assert_eq!(
        handle.calls(),
        vec![
            DeviceOperation::Probe,
            DeviceOperation::GetZip,
            DeviceOperation::DeviceSetIdle,
            DeviceOperation::DeviceRecovery,
        ]
    );
    assert!(handle.is_idle());

    let envelope = manager
        .set_workflow(DalRequest::for_action(DeviceAction::GetStatus))
        .await
        .unwrap();
    assert!(!envelope.request.has_errors());
    manager.stop_workflow().await;
}

#[tokio::test]
async fn test_second_launch_is_ignored() {
    let (manager, handle) = manager();
    manager.launch_workflow().unwrap();
    manager.launch_workflow().unwrap();
    wait_for_state(&manager, ManagerState::Manage).await;

    assert_eq!(handle.call_count(DeviceOperation::Probe), 1);
    manager.stop_workflow().await;
}
