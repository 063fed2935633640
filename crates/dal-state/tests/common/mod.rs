//! Simulator-backed rigs for sub-workflow and manager tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dal_core::config::{DalConfig, SimulatorConfig, TimeoutConfig};
use dal_hardware::{AnyCardDevice, SimulatorDevice, SimulatorHandle, event_channel};
use dal_state::{
    StateStore, SubWorkflowController, TimeoutBroker, WorkflowContext, WorkflowManager,
};

pub const SECOND_SERIAL: &str = "SIM-000-002";

/// Short timeouts so hanging calls resolve quickly under paused time.
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        get_status_ms: 200,
        get_zip_ms: 2_000,
        manual_card_entry_ms: 10_000,
        device_recovery_ms: 1_000,
        device_set_idle_ms: 500,
        ..TimeoutConfig::default()
    }
}

pub fn second_simulator_config() -> SimulatorConfig {
    SimulatorConfig {
        serial_number: SECOND_SERIAL.into(),
        sort_order: 1,
        port: "COM9".into(),
        ..SimulatorConfig::default()
    }
}

/// Controller over one simulator with events wired up.
pub struct Rig {
    pub controller: SubWorkflowController,
    pub handle: SimulatorHandle,
    pub store: StateStore,
}

pub fn rig() -> Rig {
    rig_with(fast_timeouts())
}

pub fn rig_with(timeouts: TimeoutConfig) -> Rig {
    let (publisher, events) = event_channel();
    let (simulator, handle) = SimulatorDevice::with_config(SimulatorConfig::default(), publisher);
    let store = StateStore::new();
    let context = WorkflowContext::new(
        vec![Arc::new(AnyCardDevice::from(simulator))],
        timeouts,
        TimeoutBroker::new(Duration::from_millis(500)),
        store.clone(),
    );
    Rig {
        controller: SubWorkflowController::new(context).with_events(Some(events)),
        handle,
        store,
    }
}

/// Controller over two simulators, the second with [`SECOND_SERIAL`].
pub fn two_device_rig() -> (SubWorkflowController, SimulatorHandle, SimulatorHandle) {
    let (first, first_handle) = SimulatorDevice::new();
    let (second, second_handle) = SimulatorDevice::with_config(
        second_simulator_config(),
        dal_hardware::EventPublisher::disabled(),
    );
    let context = WorkflowContext::new(
        vec![
            Arc::new(AnyCardDevice::from(first)),
            Arc::new(AnyCardDevice::from(second)),
        ],
        fast_timeouts(),
        TimeoutBroker::new(Duration::from_millis(500)),
        StateStore::new(),
    );
    (SubWorkflowController::new(context), first_handle, second_handle)
}

pub fn manager_config() -> DalConfig {
    let mut config = DalConfig::default();
    config.timeouts = fast_timeouts();
    config.manager.drain_grace_ms = 500;
    config
}

/// Manager over one simulator, not yet launched.
pub fn manager() -> (WorkflowManager, SimulatorHandle) {
    let (publisher, events) = event_channel();
    let (simulator, handle) = SimulatorDevice::with_config(SimulatorConfig::default(), publisher);
    let manager = WorkflowManager::builder(manager_config())
        .with_device(simulator)
        .with_events(events)
        .build();
    (manager, handle)
}
