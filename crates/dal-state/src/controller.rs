//! Sub-workflow controller.
//!
//! The controller walks one request through its states:
//!
//! 1. [`SubWorkflowController::on_workflow_setup`] wraps the request in a
//!    fresh envelope and clears the registers.
//! 2. [`determine_initial_state`] picks the first state from the request's
//!    first action.
//! 3. Each step asks [`SubWorkflowController::get_next_action`] for the
//!    action of the current state, preprocesses the request unless the
//!    action's [`LaunchRules`](crate::actions::LaunchRules) say otherwise,
//!    runs it and drains device events into the registers.
//! 4. The walk ends after `RequestComplete`; teardown hands back the final
//!    envelope.
//!
//! The registers (`last broker outcome`, `did timeout`, `did cancel`,
//! `device event`) are what `SanityCheck` reads to decide on recovery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dal_core::config::TimeoutConfig;
use dal_core::{
    ActionResponse, DalRequest, DeviceAction, DeviceErrorCode, DeviceErrorValue, DeviceEvent,
    DeviceIdentifier, StateEnvelope,
};
use dal_hardware::{AnyCardDevice, CardDevice, EventReceiver};

use crate::actions::{AnySubStateAction, SubStateAction};
use crate::broker::{OutcomeKind, TimeoutBroker};
use crate::state::{StateTransition, SubWorkflowState, determine_initial_state, transition};
use crate::store::StateStore;

/// Maximum transitions kept for diagnostics.
const MAX_HISTORY_SIZE: usize = 64;

/// What the previous steps left behind for `SanityCheck`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowRegisters {
    pub last_broker_outcome: Option<OutcomeKind>,
    pub did_timeout: bool,
    pub did_cancel: bool,
    pub device_event: DeviceEvent,
    /// Result of the recovery call, if one was made.
    pub recovered: Option<bool>,
}

impl WorkflowRegisters {
    pub fn record_outcome(&mut self, kind: OutcomeKind, timed_out: bool) {
        self.last_broker_outcome = Some(kind);
        self.did_timeout |= timed_out;
        self.did_cancel |= kind == OutcomeKind::Cancelled;
    }

    /// Keep `event` unless a significant one is already recorded.
    pub fn raise_event(&mut self, event: DeviceEvent) {
        if !self.device_event.is_significant() {
            self.device_event = event;
        }
    }

    pub fn needs_recovery(&self) -> bool {
        self.last_broker_outcome == Some(OutcomeKind::Failure)
            || self.did_timeout
            || self.did_cancel
            || self.device_event.is_significant()
    }
}

/// State shared by the actions of one sub-workflow.
#[derive(Debug)]
pub struct WorkflowContext {
    pub envelope: StateEnvelope,
    pub registers: WorkflowRegisters,
    devices: Vec<Arc<AnyCardDevice>>,
    target_device: Option<Arc<AnyCardDevice>>,
    timeouts: TimeoutConfig,
    broker: TimeoutBroker,
    store: StateStore,
    cancellation: CancellationToken,
}

impl WorkflowContext {
    pub fn new(
        devices: Vec<Arc<AnyCardDevice>>,
        timeouts: TimeoutConfig,
        broker: TimeoutBroker,
        store: StateStore,
    ) -> Self {
        Self {
            envelope: StateEnvelope::default(),
            registers: WorkflowRegisters::default(),
            devices,
            target_device: None,
            timeouts,
            broker,
            store,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn devices(&self) -> &[Arc<AnyCardDevice>] {
        &self.devices
    }

    /// Replace the device list, e.g. after a late discovery.
    pub fn set_devices(&mut self, devices: Vec<Arc<AnyCardDevice>>) {
        self.devices = devices;
    }

    /// Connected devices matching `identifier`, in discovery order.
    pub fn matching_devices(&self, identifier: Option<&DeviceIdentifier>) -> Vec<Arc<AnyCardDevice>> {
        self.devices
            .iter()
            .filter(|device| device.is_connected())
            .filter(|device| identifier.is_none_or(|id| device.information().matches(id)))
            .cloned()
            .collect()
    }

    /// First connected device matching `identifier`.
    pub fn find_target_device(
        &self,
        identifier: Option<&DeviceIdentifier>,
    ) -> Option<Arc<AnyCardDevice>> {
        self.matching_devices(identifier).into_iter().next()
    }

    pub fn target_device(&self) -> Option<Arc<AnyCardDevice>> {
        self.target_device.clone()
    }

    pub fn set_target_device(&mut self, device: Arc<AnyCardDevice>) {
        self.target_device = Some(device);
    }

    pub fn broker(&self) -> &TimeoutBroker {
        &self.broker
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Timeout for `action`, honouring a per-request override.
    pub fn timeout_for(&self, action: DeviceAction) -> Duration {
        let requested = self
            .envelope
            .request
            .first_action()
            .and_then(|a| a.timeout_seconds);
        self.timeouts.resolve(action, requested)
    }

    pub fn set_idle_timeout(&self) -> Duration {
        self.timeouts.set_idle()
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.timeouts.recovery()
    }

    /// Publish the envelope as saved by `state`.
    pub fn save_state(&self, state: SubWorkflowState) {
        self.store.save(state, &self.envelope);
    }
}

/// Give the request an id and one response slot per action.
pub fn preprocess(request: &mut DalRequest) {
    if request.message_id.as_deref().is_none_or(str::is_empty) {
        request.message_id = Some(Uuid::new_v4().to_string());
    }
    while request.responses.len() < request.actions.len() {
        let action = request.actions[request.responses.len()].action;
        request.responses.push(ActionResponse {
            action,
            ..ActionResponse::default()
        });
    }
}

/// Drives one request from its initial state to `RequestComplete`.
#[derive(Debug)]
pub struct SubWorkflowController {
    context: WorkflowContext,
    events: Option<EventReceiver>,
    current: Option<AnySubStateAction>,
    history: VecDeque<StateTransition>,
}

impl SubWorkflowController {
    pub fn new(context: WorkflowContext) -> Self {
        Self {
            context,
            events: None,
            current: None,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    /// Drain `events` into the registers after every step.
    pub fn with_events(mut self, events: Option<EventReceiver>) -> Self {
        self.events = events;
        self
    }

    /// Hand the event receiver back, e.g. to a replacement controller.
    pub fn take_events(&mut self) -> Option<EventReceiver> {
        self.events.take()
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut WorkflowContext {
        &mut self.context
    }

    pub fn registers(&self) -> &WorkflowRegisters {
        &self.context.registers
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// State of the action currently held, `Undefined` between requests.
    pub fn current_state(&self) -> SubWorkflowState {
        self.current
            .as_ref()
            .map_or(SubWorkflowState::Undefined, |action| action.state())
    }

    /// Action to run for `state`.
    ///
    /// With no action held this builds a fresh one for `state`. Otherwise the
    /// held action's failure flag drives [`transition`]; when the table keeps
    /// the state the same instance is returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::UndeclaredTransition` when `state` has no outgoing
    /// edge or the next state has no action.
    pub fn get_next_action(
        &mut self,
        state: SubWorkflowState,
    ) -> dal_core::Result<&mut AnySubStateAction> {
        let next = match self.current.take() {
            None => AnySubStateAction::for_state(state)?,
            Some(current) => {
                let failed = current.did_fail();
                let proposed = transition(state, failed)?;
                self.record_transition(StateTransition::new(state, proposed, failed));
                if proposed == current.state() {
                    current
                } else {
                    AnySubStateAction::for_state(proposed)?
                }
            }
        };
        Ok(self.current.insert(next))
    }

    /// Fresh terminal action.
    pub fn get_final_state(&self) -> AnySubStateAction {
        AnySubStateAction::RequestComplete(Default::default())
    }

    /// Start a new request.
    pub fn on_workflow_setup(&mut self, request: DalRequest, cancellation: CancellationToken) {
        let stale = self.discard_events();
        if stale > 0 {
            debug!(stale, "Discarded device events from before the request");
        }
        self.context.envelope = StateEnvelope::new(request);
        self.context.registers = WorkflowRegisters::default();
        self.context.target_device = None;
        self.context.cancellation = cancellation;
        self.current = None;
        self.history.clear();
    }

    /// Finish the request and return its final envelope.
    pub fn on_workflow_teardown(&mut self) -> StateEnvelope {
        self.drain_events();
        if let Some(action) = self.current.take() {
            self.record_transition(StateTransition::new(
                action.state(),
                SubWorkflowState::Undefined,
                action.did_fail(),
            ));
        }
        self.context.target_device = None;
        std::mem::take(&mut self.context.envelope)
    }

    /// Run `request` to completion.
    ///
    /// Never fails: device faults, timeouts and cancellation end up as
    /// per-device errors in the returned envelope.
    pub async fn run(&mut self, request: DalRequest, cancellation: CancellationToken) -> StateEnvelope {
        self.on_workflow_setup(request, cancellation);
        let correlation_id = self.context.envelope.header.correlation_id;

        let mut state = determine_initial_state(&self.context.envelope.request);
        if state == SubWorkflowState::Undefined {
            warn!(%correlation_id, "Request names no supported action");
            self.context.envelope.request.attach_error(DeviceErrorValue::new(
                DeviceErrorCode::UnsupportedAction,
                "request names no supported device action",
            ));
            state = SubWorkflowState::RequestComplete;
        }
        info!(%correlation_id, %state, "Sub-workflow started");

        loop {
            let next = self.get_next_action(state).map(|_| ());
            let mut action = match next {
                Ok(()) => match self.current.take() {
                    Some(action) => action,
                    None => break,
                },
                Err(e) => {
                    error!(%correlation_id, %state, error = %e, "Forcing completion");
                    self.get_final_state()
                }
            };
            if !action.launch_rules().skip_preprocessing {
                preprocess(&mut self.context.envelope.request);
            }

            debug!(%correlation_id, state = %action.state(), "Running sub-workflow action");
            action.do_work(&mut self.context).await;
            self.drain_events();

            state = action.state();
            self.current = Some(action);
            if state.is_terminal() {
                break;
            }
        }

        info!(
            %correlation_id,
            errors = self.context.envelope.request.has_errors(),
            registers = ?self.context.registers,
            "Sub-workflow complete"
        );
        self.on_workflow_teardown()
    }

    fn record_transition(&mut self, step: StateTransition) {
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(step);
    }

    /// Record significant events raised since the last drain.
    fn drain_events(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        while let Ok(notice) = events.try_recv() {
            if notice.event.is_significant() {
                info!(event = ?notice.event, serial = ?notice.serial_number, "Device event recorded");
                self.context.registers.raise_event(notice.event);
            }
        }
    }

    fn discard_events(&mut self) -> usize {
        let Some(events) = self.events.as_mut() else {
            return 0;
        };
        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dal_core::{ActionRequest, DeviceAction};
    use dal_hardware::SimulatorDevice;
    use rstest::rstest;

    fn controller() -> SubWorkflowController {
        let (simulator, _handle) = SimulatorDevice::new();
        let context = WorkflowContext::new(
            vec![Arc::new(AnyCardDevice::from(simulator))],
            TimeoutConfig::default(),
            TimeoutBroker::new(Duration::from_millis(100)),
            StateStore::new(),
        );
        SubWorkflowController::new(context)
    }

    #[test]
    fn test_preprocess_fills_id_and_slots() {
        let mut request = DalRequest::for_action(DeviceAction::GetZip);
        request.actions.push(ActionRequest::new(DeviceAction::GetStatus));
        request.responses.clear();

        preprocess(&mut request);
        let id = request.message_id.clone().unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(request.responses.len(), 2);
        assert_eq!(request.responses[1].action, Some(DeviceAction::GetStatus));

        preprocess(&mut request);
        assert_eq!(request.message_id.as_deref(), Some(id.as_str()));
        assert_eq!(request.responses.len(), 2);
    }

    #[test]
    fn test_preprocess_keeps_caller_id() {
        let mut request = DalRequest::for_action(DeviceAction::GetStatus);
        request.message_id = Some("msg-1".into());
        preprocess(&mut request);
        assert_eq!(request.message_id.as_deref(), Some("msg-1"));
    }

    #[rstest]
    #[case(WorkflowRegisters::default(), false)]
    #[case(WorkflowRegisters { last_broker_outcome: Some(OutcomeKind::Success), ..Default::default() }, false)]
    #[case(WorkflowRegisters { last_broker_outcome: Some(OutcomeKind::Failure), ..Default::default() }, true)]
    #[case(WorkflowRegisters { did_timeout: true, ..Default::default() }, true)]
    #[case(WorkflowRegisters { did_cancel: true, ..Default::default() }, true)]
    #[case(WorkflowRegisters { device_event: DeviceEvent::CancelKeyPressed, ..Default::default() }, true)]
    fn test_needs_recovery(#[case] registers: WorkflowRegisters, #[case] expected: bool) {
        assert_eq!(registers.needs_recovery(), expected);
    }

    #[test]
    fn test_first_significant_event_is_kept() {
        let mut registers = WorkflowRegisters::default();
        registers.raise_event(DeviceEvent::CancelKeyPressed);
        registers.raise_event(DeviceEvent::CardRemoved);
        assert_eq!(registers.device_event, DeviceEvent::CancelKeyPressed);
    }

    #[test]
    fn test_get_next_action_walks_table() {
        let mut controller = controller();
        assert_eq!(controller.current_state(), SubWorkflowState::Undefined);

        let action = controller.get_next_action(SubWorkflowState::GetZip).unwrap();
        assert_eq!(action.state(), SubWorkflowState::GetZip);
        assert!(controller.history().is_empty());

        let action = controller.get_next_action(SubWorkflowState::GetZip).unwrap();
        assert_eq!(action.state(), SubWorkflowState::SanityCheck);
        let action = controller
            .get_next_action(SubWorkflowState::SanityCheck)
            .unwrap();
        assert_eq!(action.state(), SubWorkflowState::RequestComplete);

        let steps: Vec<_> = controller.history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            steps,
            vec![
                (SubWorkflowState::GetZip, SubWorkflowState::SanityCheck),
                (SubWorkflowState::SanityCheck, SubWorkflowState::RequestComplete),
            ]
        );
    }

    #[test]
    fn test_get_next_action_past_complete_is_undeclared() {
        let mut controller = controller();
        controller
            .get_next_action(SubWorkflowState::RequestComplete)
            .unwrap();
        let err = controller
            .get_next_action(SubWorkflowState::RequestComplete)
            .unwrap_err();
        assert!(matches!(err, dal_core::Error::UndeclaredTransition { .. }));
    }

    #[test]
    fn test_final_state_is_fresh_complete() {
        let action = controller().get_final_state();
        assert_eq!(action.state(), SubWorkflowState::RequestComplete);
        assert!(!action.did_fail());
    }

    #[tokio::test]
    async fn test_run_without_action_completes_with_error() {
        let mut controller = controller();
        let envelope = controller
            .run(DalRequest::default(), CancellationToken::new())
            .await;

        let codes: Vec<_> = envelope.request.errors().map(|e| e.code).collect();
        assert_eq!(codes, vec![DeviceErrorCode::UnsupportedAction]);
        assert_eq!(controller.current_state(), SubWorkflowState::Undefined);
    }

    #[tokio::test]
    async fn test_run_get_status_happy_path() {
        let mut controller = controller();
        let envelope = controller
            .run(
                DalRequest::for_action(DeviceAction::GetStatus),
                CancellationToken::new(),
            )
            .await;

        assert!(!envelope.request.has_errors());
        assert!(envelope.request.message_id.is_some());
        let devices = &envelope.request.primary_response().unwrap().devices;
        assert_eq!(devices.len(), 1);
        assert_eq!(controller.registers().recovered, None);
        let last = controller.history().back().unwrap();
        assert_eq!(
            (last.from, last.to),
            (SubWorkflowState::RequestComplete, SubWorkflowState::Undefined)
        );
    }
}
