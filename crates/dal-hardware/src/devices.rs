//! Enum wrapper for card device dispatch.
//!
//! [`CardDevice`] returns `impl Future` and cannot be used as a trait
//! object. [`AnyCardDevice`] provides concrete dispatch over the supported
//! drivers instead, so discovered devices of different kinds can live in one
//! collection.
//!
//! # Examples
//!
//! ```
//! use dal_hardware::devices::AnyCardDevice;
//! use dal_hardware::simulator::SimulatorDevice;
//! use dal_hardware::traits::CardDevice;
//! use dal_hardware::types::DeviceKind;
//!
//! let (simulator, _handle) = SimulatorDevice::new();
//! let device = AnyCardDevice::from(simulator);
//! assert_eq!(device.kind(), DeviceKind::Simulator);
//! ```

use tokio_util::sync::CancellationToken;

use dal_core::{DalRequest, DeviceInformation};

use crate::Result;
use crate::simulator::SimulatorDevice;
use crate::traits::CardDevice;
use crate::types::DeviceKind;
use crate::verifone::VerifoneDevice;

/// Any supported payment terminal driver.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyCardDevice {
    /// VIPA terminal on a serial or USB connection.
    Verifone(VerifoneDevice),
    /// Scripted terminal for development and testing.
    Simulator(SimulatorDevice),
}

impl From<VerifoneDevice> for AnyCardDevice {
    fn from(device: VerifoneDevice) -> Self {
        Self::Verifone(device)
    }
}

impl From<SimulatorDevice> for AnyCardDevice {
    fn from(device: SimulatorDevice) -> Self {
        Self::Simulator(device)
    }
}

macro_rules! dispatch {
    ($self:ident, $device:ident => $call:expr) => {
        match $self {
            Self::Verifone($device) => $call,
            Self::Simulator($device) => $call,
        }
    };
}

impl CardDevice for AnyCardDevice {
    fn kind(&self) -> DeviceKind {
        dispatch!(self, device => device.kind())
    }

    fn information(&self) -> DeviceInformation {
        dispatch!(self, device => device.information())
    }

    fn sort_order(&self) -> i32 {
        dispatch!(self, device => device.sort_order())
    }

    fn is_connected(&self) -> bool {
        dispatch!(self, device => device.is_connected())
    }

    async fn probe(&self) -> Result<DeviceInformation> {
        dispatch!(self, device => device.probe().await)
    }

    async fn get_status(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.get_status(request, token).await)
    }

    async fn abort_command(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.abort_command(request, token).await)
    }

    async fn manual_card_entry(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.manual_card_entry(request, token).await)
    }

    async fn present_card(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.present_card(request, token).await)
    }

    async fn get_card_data(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.get_card_data(request, token).await)
    }

    async fn get_manual_pan_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.get_manual_pan_data(request, token).await)
    }

    async fn get_verify_amount(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.get_verify_amount(request, token).await)
    }

    async fn get_credit_or_debit(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.get_credit_or_debit(request, token).await)
    }

    async fn get_pin(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.get_pin(request, token).await)
    }

    async fn get_zip(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.get_zip(request, token).await)
    }

    async fn remove_card(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.remove_card(request, token).await)
    }

    async fn device_ui(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        dispatch!(self, device => device.device_ui(request, token).await)
    }

    async fn start_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.start_pre_swipe_mode(request, token).await)
    }

    async fn end_pre_swipe_mode(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.end_pre_swipe_mode(request, token).await)
    }

    async fn purge_held_card_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        dispatch!(self, device => device.purge_held_card_data(request, token).await)
    }

    async fn device_recovery(&self, token: CancellationToken) -> Result<bool> {
        dispatch!(self, device => device.device_recovery(token).await)
    }

    async fn device_set_idle(&self, token: CancellationToken) -> Result<()> {
        dispatch!(self, device => device.device_set_idle(token).await)
    }
}
