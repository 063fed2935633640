//! Device capability interface.
//!
//! Every payment terminal driver implements [`CardDevice`]. Sub-workflow
//! actions call exactly one capability per state, always through the
//! timeout broker, so each method receives a [`CancellationToken`] that fires
//! when the broker gives up on the call (timeout) or the caller aborts it.
//!
//! # Request Flow
//!
//! Capabilities take the shared [`DalRequest`] by value and return it with
//! their results written in (device responses, captured card data, prompt
//! results). A driver that fails returns an error instead; the calling action
//! turns it into a structured error entry keyed by the device serial.
//!
//! # Cancellation
//!
//! Methods should observe the token wherever they wait on the cardholder. A
//! driver that notices cancellation leaves the terminal idle and returns the
//! request without new data.
//!
//! # Object Safety and Dynamic Dispatch
//!
//! The methods return `impl Future`, so the trait is not object-safe. Drivers
//! are selected at runtime through the [`AnyCardDevice`](crate::devices::AnyCardDevice)
//! enum instead of `Box<dyn CardDevice>`:
//!
//! ```no_run
//! use dal_core::{DalRequest, DeviceAction};
//! use dal_hardware::devices::AnyCardDevice;
//! use dal_hardware::simulator::SimulatorDevice;
//! use dal_hardware::traits::CardDevice;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> dal_hardware::Result<()> {
//! let (simulator, _handle) = SimulatorDevice::new();
//! let device = AnyCardDevice::Simulator(simulator);
//! device.probe().await?;
//!
//! let request = DalRequest::for_action(DeviceAction::GetStatus);
//! let request = device.get_status(request, CancellationToken::new()).await?;
//! println!("{:?}", request.primary_response());
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use tokio_util::sync::CancellationToken;

use dal_core::{DalRequest, DeviceInformation};

use crate::error::Result;
use crate::types::DeviceKind;

/// Capability surface of a payment terminal.
///
/// Futures returned by the methods are `Send` so the broker can run them as
/// spawned tasks.
pub trait CardDevice: Send + Sync {
    /// Driver family.
    fn kind(&self) -> DeviceKind;

    /// Identity captured by the last successful probe.
    fn information(&self) -> DeviceInformation;

    /// Position among connected devices; lower sorts first.
    fn sort_order(&self) -> i32;

    fn is_connected(&self) -> bool;

    /// Connect and fill the device information.
    ///
    /// # Errors
    ///
    /// Returns an error when the device does not answer or is not a
    /// supported model.
    fn probe(&self) -> impl Future<Output = Result<DeviceInformation>> + Send;

    /// Report the device identity into the request.
    fn get_status(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Abort the running device command.
    fn abort_command(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Keyed card entry (PAN and expiry).
    ///
    /// A cardholder cancel publishes
    /// [`DeviceEvent::CancelKeyPressed`](dal_core::DeviceEvent::CancelKeyPressed)
    /// and returns the request without card data.
    fn manual_card_entry(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Prompt for a card and wait until one is inserted or swiped.
    fn present_card(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Read the data of the presented card.
    fn get_card_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Keyed PAN entry including CVV2.
    fn get_manual_pan_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Ask the cardholder to confirm the amount.
    fn get_verify_amount(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Ask the cardholder to choose credit or debit.
    fn get_credit_or_debit(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Collect an encrypted PIN block.
    fn get_pin(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Collect the billing zip code.
    fn get_zip(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Prompt until the card is removed.
    fn remove_card(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Show a custom screen described by the request payload.
    fn device_ui(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    fn start_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    fn end_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    fn purge_held_card_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> impl Future<Output = Result<DalRequest>> + Send;

    /// Bring the device back to a known state.
    ///
    /// Returns `Ok(false)` when the device answered but did not recover.
    fn device_recovery(&self, token: CancellationToken) -> impl Future<Output = Result<bool>> + Send;

    /// Close the contactless reader and show the idle screen.
    fn device_set_idle(&self, token: CancellationToken) -> impl Future<Output = Result<()>> + Send;
}
