//! Simulated payment terminal for testing and development.
//!
//! [`SimulatorDevice`] implements [`CardDevice`] without any transport. Its
//! behavior is scripted per operation through a [`SimulatorHandle`], which
//! also exposes the call log and idle flag for assertions.
//!
//! # Examples
//!
//! ```
//! use dal_core::{DalRequest, DeviceAction};
//! use dal_hardware::simulator::{SimulatedBehavior, SimulatorDevice};
//! use dal_hardware::traits::CardDevice;
//! use dal_hardware::types::DeviceOperation;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (device, handle) = SimulatorDevice::new();
//!     handle.set_behavior(DeviceOperation::GetZip, SimulatedBehavior::Fail);
//!
//!     let request = DalRequest::for_action(DeviceAction::GetZip);
//!     assert!(device.get_zip(request, CancellationToken::new()).await.is_err());
//!     assert_eq!(handle.calls(), vec![DeviceOperation::GetZip]);
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dal_core::config::SimulatorConfig;
use dal_core::constants::SIMULATOR_MANUFACTURER;
use dal_core::{
    CapturedCardData, CardEntryMode, DalRequest, DeviceEvent, DeviceInformation, PromptResult,
};

use crate::error::{HardwareError, Result};
use crate::events::EventPublisher;
use crate::traits::CardDevice;
use crate::types::{DeviceKind, DeviceOperation};

/// Scripted reaction of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulatedBehavior {
    #[default]
    Succeed,
    /// Fail with a communication error.
    Fail,
    /// Never answer; returns only once the token is cancelled.
    Hang,
    /// The cardholder presses cancel on the keypad.
    UserCancel,
}

#[derive(Debug)]
struct SimulatorState {
    behaviors: HashMap<DeviceOperation, SimulatedBehavior>,
    calls: Vec<DeviceOperation>,
    card: CapturedCardData,
    prompt_value: String,
    recovery_result: bool,
    connected: bool,
    idle: bool,
}

impl Default for SimulatorState {
    fn default() -> Self {
        Self {
            behaviors: HashMap::new(),
            calls: Vec::new(),
            card: CapturedCardData {
                entry_mode: CardEntryMode::Manual,
                masked_pan: Some("411111******1111".into()),
                expiry: Some("2512".into()),
                cvv_captured: false,
            },
            prompt_value: "1".into(),
            recovery_result: true,
            connected: true,
            idle: true,
        }
    }
}

fn lock(state: &Mutex<SimulatorState>) -> MutexGuard<'_, SimulatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a scripted operation ended.
enum Step {
    Proceed,
    /// The token fired while the operation hung.
    Cancelled,
    /// The simulated cardholder pressed cancel.
    UserCancelled,
}

/// Simulated terminal.
#[derive(Debug)]
pub struct SimulatorDevice {
    config: SimulatorConfig,
    info: DeviceInformation,
    state: Arc<Mutex<SimulatorState>>,
    events: EventPublisher,
}

/// Controls a [`SimulatorDevice`] from tests.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimulatorState>>,
}

impl SimulatorDevice {
    /// Simulator with the default identity and no event channel.
    pub fn new() -> (Self, SimulatorHandle) {
        Self::with_config(SimulatorConfig::default(), EventPublisher::disabled())
    }

    pub fn with_config(config: SimulatorConfig, events: EventPublisher) -> (Self, SimulatorHandle) {
        let info = DeviceInformation::new(SIMULATOR_MANUFACTURER, config.model.clone())
            .with_serial_number(config.serial_number.clone())
            .with_firmware_version(config.firmware_version.clone())
            .with_port(config.port.clone());
        let state = Arc::new(Mutex::new(SimulatorState::default()));
        let handle = SimulatorHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                config,
                info,
                state,
                events,
            },
            handle,
        )
    }

    fn publish(&self, event: DeviceEvent) {
        self.events
            .publish(event, Some(self.info.serial_number.clone()));
    }

    fn mark_idle(&self, idle: bool) {
        lock(&self.state).idle = idle;
    }

    /// Record the call and play its scripted behavior.
    async fn play(&self, operation: DeviceOperation, token: &CancellationToken) -> Result<Step> {
        let behavior = {
            let mut state = lock(&self.state);
            state.calls.push(operation);
            if !state.connected {
                return Err(HardwareError::disconnected(&self.config.port));
            }
            if is_interactive(operation) {
                state.idle = false;
            }
            state.behaviors.get(&operation).copied().unwrap_or_default()
        };
        debug!(device = %self.config.port, %operation, ?behavior, "Simulated call");

        if self.config.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.response_delay_ms)).await;
        }

        match behavior {
            SimulatedBehavior::Succeed => Ok(Step::Proceed),
            SimulatedBehavior::Fail => Err(HardwareError::communication(format!(
                "simulated {operation} failure"
            ))),
            SimulatedBehavior::Hang => {
                token.cancelled().await;
                Ok(Step::Cancelled)
            }
            SimulatedBehavior::UserCancel => Ok(Step::UserCancelled),
        }
    }

    /// Set idle the way a driver does on its own exit paths, logging the call.
    fn settle(&self) {
        let mut state = lock(&self.state);
        state.calls.push(DeviceOperation::DeviceSetIdle);
        state.idle = true;
    }

    /// Play `operation`; on success let `fill` write its result.
    async fn respond(
        &self,
        operation: DeviceOperation,
        mut request: DalRequest,
        token: CancellationToken,
        fill: impl FnOnce(&Self, &mut DalRequest),
    ) -> Result<DalRequest> {
        match self.play(operation, &token).await? {
            Step::Proceed => {
                fill(self, &mut request);
                if is_interactive(operation) {
                    self.settle();
                }
                Ok(request)
            }
            Step::UserCancelled => {
                info!(device = %self.config.port, %operation, "Simulated cancel key");
                self.publish(DeviceEvent::CancelKeyPressed);
                self.settle();
                Ok(request)
            }
            // The caller that cancelled puts the screen back itself.
            Step::Cancelled if is_interactive(operation) => Ok(request),
            Step::Cancelled => Err(HardwareError::Cancelled),
        }
    }

    fn prompt(&self, request: &mut DalRequest) {
        let value = lock(&self.state).prompt_value.clone();
        request.primary_response_mut().prompt = Some(PromptResult::new("Success", value));
    }
}

/// Operations that wait on the cardholder and leave the screen changed.
fn is_interactive(operation: DeviceOperation) -> bool {
    matches!(
        operation,
        DeviceOperation::ManualCardEntry
            | DeviceOperation::PresentCard
            | DeviceOperation::GetManualPanData
            | DeviceOperation::GetVerifyAmount
            | DeviceOperation::GetCreditOrDebit
            | DeviceOperation::GetPin
            | DeviceOperation::GetZip
            | DeviceOperation::RemoveCard
            | DeviceOperation::DeviceUi
    )
}

impl SimulatorHandle {
    pub fn set_behavior(&self, operation: DeviceOperation, behavior: SimulatedBehavior) {
        lock(&self.state).behaviors.insert(operation, behavior);
    }

    /// Restore every operation to [`SimulatedBehavior::Succeed`].
    pub fn reset_behaviors(&self) {
        lock(&self.state).behaviors.clear();
    }

    pub fn set_card_data(&self, card: CapturedCardData) {
        lock(&self.state).card = card;
    }

    pub fn set_prompt_value(&self, value: impl Into<String>) {
        lock(&self.state).prompt_value = value.into();
    }

    /// Value reported by a successful recovery call.
    pub fn set_recovery_result(&self, recovered: bool) {
        lock(&self.state).recovery_result = recovered;
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<DeviceOperation> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, operation: DeviceOperation) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| **c == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.state).idle
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

impl CardDevice for SimulatorDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Simulator
    }

    fn information(&self) -> DeviceInformation {
        self.info.clone()
    }

    fn sort_order(&self) -> i32 {
        self.config.sort_order
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn probe(&self) -> Result<DeviceInformation> {
        {
            // A dropped link comes back unless the probe itself is scripted to fail.
            let mut state = lock(&self.state);
            let behavior = state
                .behaviors
                .get(&DeviceOperation::Probe)
                .copied()
                .unwrap_or_default();
            if !state.connected && behavior != SimulatedBehavior::Fail {
                state.connected = true;
                info!(device = %self.config.port, "Simulated link reopened");
            }
        }
        match self.play(DeviceOperation::Probe, &CancellationToken::new()).await {
            Ok(_) => {
                info!(
                    model = %self.info.model,
                    serial = %self.info.serial_number,
                    "Simulator device found"
                );
                Ok(self.info.clone())
            }
            Err(e) => Err(HardwareError::initialization_failed(e.to_string())),
        }
    }

    async fn get_status(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetStatus, request, token, |device, request| {
            request
                .primary_response_mut()
                .devices
                .push(device.info.to_response());
        })
        .await
    }

    async fn abort_command(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        let request = self
            .respond(DeviceOperation::AbortCommand, request, token, |_, request| {
                request.primary_response_mut().prompt = Some(PromptResult {
                    status: Some("Success".into()),
                    value: None,
                });
            })
            .await?;
        self.mark_idle(true);
        Ok(request)
    }

    async fn manual_card_entry(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::ManualCardEntry, request, token, |device, request| {
            let card = lock(&device.state).card.clone();
            request.primary_response_mut().card_data = Some(card);
        })
        .await
    }

    async fn present_card(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::PresentCard, request, token, |_, request| {
            request.primary_response_mut().card_data = Some(CapturedCardData {
                entry_mode: CardEntryMode::Chip,
                masked_pan: None,
                expiry: None,
                cvv_captured: false,
            });
        })
        .await
    }

    async fn get_card_data(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetCardData, request, token, |device, request| {
            let card = lock(&device.state).card.clone();
            request.primary_response_mut().card_data = Some(card);
        })
        .await
    }

    async fn get_manual_pan_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetManualPanData, request, token, |device, request| {
            let card = lock(&device.state).card.clone();
            request.primary_response_mut().card_data = Some(CapturedCardData {
                cvv_captured: true,
                ..card
            });
        })
        .await
    }

    async fn get_verify_amount(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetVerifyAmount, request, token, Self::prompt)
            .await
    }

    async fn get_credit_or_debit(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetCreditOrDebit, request, token, Self::prompt)
            .await
    }

    async fn get_pin(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetPin, request, token, |_, request| {
            request.primary_response_mut().prompt = Some(PromptResult {
                status: Some("Success".into()),
                value: None,
            });
        })
        .await
    }

    async fn get_zip(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::GetZip, request, token, Self::prompt)
            .await
    }

    async fn remove_card(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::RemoveCard, request, token, |device, _| {
            device.publish(DeviceEvent::CardRemoved);
        })
        .await
    }

    async fn device_ui(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.respond(DeviceOperation::DeviceUi, request, token, Self::prompt)
            .await
    }

    async fn start_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::StartPreSwipeMode, request, token, |_, _| {})
            .await
    }

    async fn end_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::EndPreSwipeMode, request, token, |_, _| {})
            .await
    }

    async fn purge_held_card_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.respond(DeviceOperation::PurgeHeldCardData, request, token, |_, _| {})
            .await
    }

    async fn device_recovery(&self, token: CancellationToken) -> Result<bool> {
        match self.play(DeviceOperation::DeviceRecovery, &token).await? {
            Step::Cancelled => Err(HardwareError::Cancelled),
            Step::Proceed | Step::UserCancelled => {
                let mut state = lock(&self.state);
                state.idle = true;
                Ok(state.recovery_result)
            }
        }
    }

    async fn device_set_idle(&self, token: CancellationToken) -> Result<()> {
        match self.play(DeviceOperation::DeviceSetIdle, &token).await? {
            Step::Cancelled => Err(HardwareError::Cancelled),
            Step::Proceed | Step::UserCancelled => {
                self.mark_idle(true);
                Ok(())
            }
        }
    }
}
