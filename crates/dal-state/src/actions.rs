//! Per-state sub-workflow actions.
//!
//! One action object runs per state. Action states resolve their target
//! device, call the matching capability through the broker and write the
//! result (or a structured per-device error) into the shared envelope.
//! `SanityCheck` recovers the device when the registers say the previous step
//! went wrong, and `RequestComplete` publishes the final snapshot.
//!
//! Like [`CardDevice`], [`SubStateAction`] returns `impl Future` and is not
//! object-safe; [`AnySubStateAction`] is the state-keyed factory and the
//! dispatch enum.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dal_core::{DalRequest, DeviceAction, DeviceErrorCode, DeviceErrorValue, DeviceEvent, Error};
use dal_hardware::{AnyCardDevice, CardDevice, HardwareError};

use crate::broker::{BrokerFailure, BrokerOutcome, OutcomeKind};
use crate::controller::WorkflowContext;
use crate::state::SubWorkflowState;

/// How the controller prepares an action before `do_work`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchRules {
    /// The device call observes the workflow's cancellation token. Without
    /// it the call runs to completion or timeout.
    pub request_cancellation_token: bool,
    /// Skip request preprocessing (message id, response slots).
    pub skip_preprocessing: bool,
}

/// Progress of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionStatus {
    #[default]
    Pending,
    Complete,
    Error,
}

/// Behaviour of one sub-workflow state.
pub trait SubStateAction: Send {
    fn state(&self) -> SubWorkflowState;

    fn launch_rules(&self) -> LaunchRules {
        LaunchRules::default()
    }

    fn status(&self) -> ActionStatus;

    /// Failure flag fed to the transition table.
    fn did_fail(&self) -> bool {
        self.status() == ActionStatus::Error
    }

    fn do_work(&mut self, context: &mut WorkflowContext) -> impl Future<Output = ()> + Send;
}

/// Calls one device capability.
#[derive(Debug)]
pub struct DeviceStepAction {
    state: SubWorkflowState,
    action: DeviceAction,
    status: ActionStatus,
}

impl DeviceStepAction {
    pub fn new(action: DeviceAction) -> Self {
        Self {
            state: SubWorkflowState::from_action(action),
            action,
            status: ActionStatus::Pending,
        }
    }

    pub fn action(&self) -> DeviceAction {
        self.action
    }

    fn token(&self, context: &WorkflowContext) -> CancellationToken {
        if self.launch_rules().request_cancellation_token {
            context.cancellation().clone()
        } else {
            CancellationToken::new()
        }
    }

    /// Run the capability on the one target device.
    async fn run_on_target(&mut self, context: &mut WorkflowContext) {
        let identifier = context.envelope.request.device_identifier().cloned();
        let Some(device) = context.find_target_device(identifier.as_ref()) else {
            warn!(action = %self.action, ?identifier, "No device matches the request");
            context.envelope.request.attach_error(DeviceErrorValue::new(
                DeviceErrorCode::DeviceNotFound,
                format!("no connected device for {}", self.action),
            ));
            return;
        };
        context.set_target_device(Arc::clone(&device));

        let token = self.token(context);
        let timeout = context.timeout_for(self.action);
        let request = context.envelope.request.clone();
        let action = self.action;
        let callee = Arc::clone(&device);
        let outcome = context
            .broker()
            .execute_with_timeout(
                move |token| invoke(callee, action, request, token),
                timeout,
                &token,
            )
            .await;

        let serial = device.information().serial_number;
        context.registers.record_outcome(outcome.kind(), outcome.is_timeout());
        match outcome {
            BrokerOutcome::Success(request) => {
                debug!(action = %self.action, device = %serial, "Device call succeeded");
                context.envelope.request = request;
            }
            BrokerOutcome::Failure(failure) => {
                warn!(action = %self.action, device = %serial, %failure, "Device call failed");
                self.status = ActionStatus::Error;
                context
                    .envelope
                    .request
                    .attach_device_error(&serial, failure_value(self.action, &failure));
            }
            BrokerOutcome::Cancelled => {
                info!(action = %self.action, device = %serial, "Device call cancelled");
                context.registers.raise_event(DeviceEvent::RequestCancelled);
                context.envelope.request.attach_device_error(
                    &serial,
                    DeviceErrorValue::new(
                        DeviceErrorCode::CancelRequested,
                        format!("{} cancelled by caller", self.action),
                    ),
                );
                set_device_idle(context, &device).await;
            }
        }
    }

    /// Query every matching device; failures are reported per device.
    async fn query_all(&mut self, context: &mut WorkflowContext) {
        let identifier = context.envelope.request.device_identifier().cloned();
        let devices = context.matching_devices(identifier.as_ref());
        if devices.is_empty() {
            warn!(?identifier, "No device to query for status");
            context.envelope.request.attach_error(DeviceErrorValue::new(
                DeviceErrorCode::DeviceNotFound,
                "no connected device to query",
            ));
            return;
        }

        let token = self.token(context);
        let timeout = context.timeout_for(self.action);
        let mut worst = OutcomeKind::Success;
        let mut timed_out = false;

        for device in devices {
            if context.target_device().is_none() {
                context.set_target_device(Arc::clone(&device));
            }
            let request = DalRequest {
                responses: Vec::new(),
                ..context.envelope.request.clone()
            };
            let callee = Arc::clone(&device);
            let outcome = context
                .broker()
                .execute_with_timeout(
                    move |token| async move { callee.get_status(request, token).await },
                    timeout,
                    &token,
                )
                .await;

            let serial = device.information().serial_number;
            timed_out |= outcome.is_timeout();
            match outcome {
                BrokerOutcome::Success(reply) => {
                    let found = reply
                        .primary_response()
                        .map(|r| r.devices.clone())
                        .unwrap_or_default();
                    context
                        .envelope
                        .request
                        .primary_response_mut()
                        .devices
                        .extend(found);
                }
                BrokerOutcome::Failure(failure) => {
                    warn!(device = %serial, %failure, "Status query failed");
                    worst = OutcomeKind::Failure;
                    self.status = ActionStatus::Error;
                    context.set_target_device(Arc::clone(&device));
                    context
                        .envelope
                        .request
                        .attach_device_error(&serial, failure_value(self.action, &failure));
                }
                BrokerOutcome::Cancelled => {
                    if worst == OutcomeKind::Success {
                        worst = OutcomeKind::Cancelled;
                    }
                    break;
                }
            }
        }
        context.registers.record_outcome(worst, timed_out);
    }
}

impl SubStateAction for DeviceStepAction {
    fn state(&self) -> SubWorkflowState {
        self.state
    }

    fn launch_rules(&self) -> LaunchRules {
        LaunchRules {
            // Status queries run to completion so every device reports.
            request_cancellation_token: self.action != DeviceAction::GetStatus,
            skip_preprocessing: false,
        }
    }

    fn status(&self) -> ActionStatus {
        self.status
    }

    async fn do_work(&mut self, context: &mut WorkflowContext) {
        if self.action == DeviceAction::GetStatus {
            self.query_all(context).await;
        } else {
            self.run_on_target(context).await;
        }
        context.save_state(self.state);
        if self.status == ActionStatus::Pending {
            self.status = ActionStatus::Complete;
        }
    }
}

/// Call the capability behind `action`.
async fn invoke(
    device: Arc<AnyCardDevice>,
    action: DeviceAction,
    request: DalRequest,
    token: CancellationToken,
) -> Result<DalRequest, HardwareError> {
    match action {
        DeviceAction::GetStatus => device.get_status(request, token).await,
        DeviceAction::AbortCommand => device.abort_command(request, token).await,
        DeviceAction::ManualCardEntry => device.manual_card_entry(request, token).await,
        DeviceAction::PresentCard => device.present_card(request, token).await,
        DeviceAction::GetCardData => device.get_card_data(request, token).await,
        DeviceAction::GetManualPanData => device.get_manual_pan_data(request, token).await,
        DeviceAction::GetVerifyAmount => device.get_verify_amount(request, token).await,
        DeviceAction::GetCreditOrDebit => device.get_credit_or_debit(request, token).await,
        DeviceAction::GetPin => device.get_pin(request, token).await,
        DeviceAction::GetZip => device.get_zip(request, token).await,
        DeviceAction::RemoveCard => device.remove_card(request, token).await,
        DeviceAction::DeviceUi => device.device_ui(request, token).await,
        DeviceAction::StartPreSwipeMode => device.start_pre_swipe_mode(request, token).await,
        DeviceAction::EndPreSwipeMode => device.end_pre_swipe_mode(request, token).await,
        DeviceAction::PurgeHeldCardData => device.purge_held_card_data(request, token).await,
    }
}

/// Return `device` to its idle screen after the caller abandoned a call.
///
/// Runs under the set-idle timeout and ignores the workflow token, which has
/// already fired.
async fn set_device_idle(context: &WorkflowContext, device: &Arc<AnyCardDevice>) {
    let callee = Arc::clone(device);
    let outcome = context
        .broker()
        .execute_with_timeout(
            move |token| async move { callee.device_set_idle(token).await },
            context.set_idle_timeout(),
            &CancellationToken::new(),
        )
        .await;
    if let BrokerOutcome::Failure(failure) = outcome {
        warn!(device = %device.information().serial_number, %failure, "Setting device idle failed");
    }
}

fn failure_value(action: DeviceAction, failure: &BrokerFailure) -> DeviceErrorValue {
    let code = match failure {
        BrokerFailure::Timeout(_) => DeviceErrorCode::Timeout,
        BrokerFailure::Faulted(HardwareError::Unsupported { .. }) => {
            DeviceErrorCode::UnsupportedAction
        }
        BrokerFailure::Faulted(HardwareError::CardReadError { .. }) => DeviceErrorCode::CardNotRead,
        BrokerFailure::Faulted(HardwareError::SlotBusy { .. }) => DeviceErrorCode::DeviceBusy,
        BrokerFailure::Faulted(HardwareError::Cancelled) => DeviceErrorCode::CancelRequested,
        BrokerFailure::Faulted(_) => DeviceErrorCode::DeviceFailure,
    };
    DeviceErrorValue::new(code, format!("{action}: {failure}"))
}

/// Recovers the device when the last step left it in doubt. Never fails.
#[derive(Debug, Default)]
pub struct SanityCheckAction {
    status: ActionStatus,
}

impl SubStateAction for SanityCheckAction {
    fn state(&self) -> SubWorkflowState {
        SubWorkflowState::SanityCheck
    }

    fn launch_rules(&self) -> LaunchRules {
        LaunchRules {
            request_cancellation_token: false,
            skip_preprocessing: true,
        }
    }

    fn status(&self) -> ActionStatus {
        self.status
    }

    async fn do_work(&mut self, context: &mut WorkflowContext) {
        if !context.registers.needs_recovery() {
            debug!("Device left in a clean state, no recovery needed");
        } else if let Some(device) = context.target_device() {
            info!(registers = ?context.registers, "Recovering device");
            let timeout = context.recovery_timeout();
            let callee = Arc::clone(&device);
            let outcome = context
                .broker()
                .execute_with_timeout(
                    move |token| async move { callee.device_recovery(token).await },
                    timeout,
                    &CancellationToken::new(),
                )
                .await;

            let recovered = matches!(outcome, BrokerOutcome::Success(true));
            context.registers.recovered = Some(recovered);
            if !recovered {
                let serial = device.information().serial_number;
                warn!(device = %serial, outcome = ?outcome.kind(), "Device recovery failed");
                context.envelope.request.attach_device_error(
                    &serial,
                    DeviceErrorValue::new(DeviceErrorCode::RecoveryFailed, "device recovery failed"),
                );
            }
        } else {
            debug!("Recovery requested but no device was targeted");
        }

        context.save_state(SubWorkflowState::SanityCheck);
        self.status = ActionStatus::Complete;
    }
}

/// Publishes the final snapshot.
#[derive(Debug, Default)]
pub struct RequestCompleteAction {
    status: ActionStatus,
}

impl SubStateAction for RequestCompleteAction {
    fn state(&self) -> SubWorkflowState {
        SubWorkflowState::RequestComplete
    }

    fn launch_rules(&self) -> LaunchRules {
        LaunchRules {
            request_cancellation_token: false,
            skip_preprocessing: true,
        }
    }

    fn status(&self) -> ActionStatus {
        self.status
    }

    async fn do_work(&mut self, context: &mut WorkflowContext) {
        context.save_state(SubWorkflowState::RequestComplete);
        self.status = ActionStatus::Complete;
    }
}

/// Any sub-workflow action.
#[derive(Debug)]
pub enum AnySubStateAction {
    Device(DeviceStepAction),
    SanityCheck(SanityCheckAction),
    RequestComplete(RequestCompleteAction),
}

impl AnySubStateAction {
    /// Fresh action for `state`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UndeclaredTransition` for `Undefined`, which has no action.
    pub fn for_state(state: SubWorkflowState) -> dal_core::Result<Self> {
        match state {
            SubWorkflowState::Undefined => Err(Error::UndeclaredTransition {
                state: state.to_string(),
            }),
            SubWorkflowState::SanityCheck => Ok(Self::SanityCheck(SanityCheckAction::default())),
            SubWorkflowState::RequestComplete => {
                Ok(Self::RequestComplete(RequestCompleteAction::default()))
            }
            other => other
                .action()
                .map(|action| Self::Device(DeviceStepAction::new(action)))
                .ok_or_else(|| Error::UndeclaredTransition {
                    state: other.to_string(),
                }),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $action:ident => $call:expr) => {
        match $self {
            Self::Device($action) => $call,
            Self::SanityCheck($action) => $call,
            Self::RequestComplete($action) => $call,
        }
    };
}

impl SubStateAction for AnySubStateAction {
    fn state(&self) -> SubWorkflowState {
        dispatch!(self, action => action.state())
    }

    fn launch_rules(&self) -> LaunchRules {
        dispatch!(self, action => action.launch_rules())
    }

    fn status(&self) -> ActionStatus {
        dispatch!(self, action => action.status())
    }

    fn did_fail(&self) -> bool {
        dispatch!(self, action => action.did_fail())
    }

    async fn do_work(&mut self, context: &mut WorkflowContext) {
        dispatch!(self, action => action.do_work(context).await)
    }
}
