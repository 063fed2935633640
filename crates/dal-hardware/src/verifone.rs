//! Verifone VIPA terminal driver.
//!
//! [`VerifoneDevice`] implements [`CardDevice`] on top of the [`Vipa`]
//! command layer. It owns one terminal connection; the workflow manager
//! guarantees a single sub-workflow uses it at a time.
//!
//! Interactive capabilities (manual entry, prompts, card presence) observe
//! the cancellation token. On cancellation the terminal is set idle and the
//! request is returned without new data; the broker reports the outcome.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dal_core::config::VerifoneConfig;
use dal_core::constants::CARD_POLL_INTERVAL_MS;
use dal_core::{
    CapturedCardData, CardEntryMode, DalRequest, DeviceEvent, DeviceInformation, PromptResult,
};
use dal_protocol::{Backlight, DisplayMessage, ManualEntryFlags, ResetFlags, VipaStatus};

use crate::connection::VipaConnection;
use crate::error::{HardwareError, Result};
use crate::events::EventPublisher;
use crate::traits::CardDevice;
use crate::types::{CardPresence, DeviceKind};
use crate::vipa::{MANUFACTURER, PromptReply, Vipa};

const VERIFY_AMOUNT_RESOURCE: &str = "mapp/verify_amount.html";
const CREDIT_OR_DEBIT_RESOURCE: &str = "mapp/credit_or_debit.html";
const ZIP_RESOURCE: &str = "mapp/zip_entry.html";

/// Reopens the transport of a terminal whose connection dropped.
#[derive(Clone)]
pub struct Reconnector(Arc<dyn Fn() -> Result<VipaConnection> + Send + Sync>);

impl Reconnector {
    pub fn new(connect: impl Fn() -> Result<VipaConnection> + Send + Sync + 'static) -> Self {
        Self(Arc::new(connect))
    }

    pub fn connect(&self) -> Result<VipaConnection> {
        (self.0)()
    }
}

impl fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reconnector")
    }
}

/// Driver for a VIPA terminal on one connection.
#[derive(Debug)]
pub struct VerifoneDevice {
    vipa: Vipa,
    config: VerifoneConfig,
    port: String,
    info: RwLock<DeviceInformation>,
    events: EventPublisher,
    reconnector: Option<Reconnector>,
}

impl VerifoneDevice {
    /// Driver over an open connection. Call [`CardDevice::probe`] before use.
    pub fn new(
        connection: VipaConnection,
        config: VerifoneConfig,
        device_result_timeout: Duration,
        events: EventPublisher,
    ) -> Self {
        let port = connection.name().to_string();
        Self {
            vipa: Vipa::new(connection, device_result_timeout),
            info: RwLock::new(DeviceInformation::new(MANUFACTURER, "").with_port(port.clone())),
            config,
            port,
            events,
            reconnector: None,
        }
    }

    /// Let [`CardDevice::probe`] reopen the transport after a disconnect.
    pub fn with_reconnector(mut self, reconnector: Reconnector) -> Self {
        self.reconnector = Some(reconnector);
        self
    }

    pub fn with_node_address(mut self, nad: u8) -> Self {
        self.vipa = self.vipa.with_node_address(nad);
        self
    }

    pub fn with_cancel_retries(mut self, retries: u32) -> Self {
        self.vipa = self.vipa.with_cancel_retries(retries);
        self
    }

    pub fn vipa(&self) -> &Vipa {
        &self.vipa
    }

    fn serial(&self) -> String {
        self.information().serial_number
    }

    fn publish(&self, event: DeviceEvent) {
        self.events.publish(event, Some(self.serial()));
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.vipa.is_connected() {
            Ok(())
        } else {
            Err(HardwareError::disconnected(&self.port))
        }
    }

    /// Reopen the connection through the reconnector if it dropped.
    fn restore_link(&self) -> Result<()> {
        if self.vipa.is_connected() {
            return Ok(());
        }
        let Some(reconnector) = &self.reconnector else {
            return Err(HardwareError::disconnected(&self.port));
        };
        let connection = reconnector.connect()?;
        self.vipa.replace_connection(connection);
        info!(device = %self.port, "Terminal connection reopened");
        Ok(())
    }

    /// Close the contactless reader (forced) and show the idle screen.
    pub async fn set_idle(&self) -> Result<()> {
        if let Err(e) = self.vipa.close_contactless_reader(true).await {
            warn!(device = %self.port, error = %e, "Closing contactless reader failed");
        }
        let status = self
            .vipa
            .display_message(DisplayMessage::Idle, Backlight::Unchanged, None)
            .await?;
        if !status.is_success() {
            return Err(HardwareError::device_status(status.code()));
        }
        Ok(())
    }

    /// Set idle, logging instead of failing. Used on exit paths whose own
    /// result matters more.
    async fn leave_idle(&self) {
        if let Err(e) = self.set_idle().await {
            warn!(device = %self.port, error = %e, "Setting device idle failed");
        }
    }

    async fn capture_manual_pan(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
        flags: ManualEntryFlags,
    ) -> Result<DalRequest> {
        self.ensure_connected()?;
        if let Err(e) = self.vipa.keyboard_status(true).await {
            debug!(device = %self.port, error = %e, "Keyboard status reporting unavailable");
        }

        let entry = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            entry = self.vipa.manual_pan_entry(flags) => Some(entry),
        };

        let result = match entry {
            None => {
                info!(device = %self.port, "Manual entry cancelled by caller");
                Ok(request)
            }
            Some(Err(e)) => Err(e),
            Some(Ok(reply)) if reply.status == VipaStatus::UserEntryCancelled => {
                info!(device = %self.port, "Cardholder cancelled manual entry");
                self.publish(DeviceEvent::CancelKeyPressed);
                Ok(request)
            }
            Some(Ok(reply)) if reply.status.is_success() => {
                request.primary_response_mut().card_data = reply.card;
                Ok(request)
            }
            Some(Ok(reply)) => Err(HardwareError::device_status(reply.status.code())),
        };

        self.leave_idle().await;
        result
    }

    /// Poll card status until `done` holds or the token fires.
    async fn wait_for_card(
        &self,
        token: &CancellationToken,
        done: impl Fn(CardPresence) -> bool,
    ) -> Result<Option<CardPresence>> {
        loop {
            let presence = self.vipa.card_status().await?;
            if done(presence) {
                return Ok(Some(presence));
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(Duration::from_millis(CARD_POLL_INTERVAL_MS)) => {}
            }
        }
    }

    async fn prompt(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
        resource: &str,
        pairs: &[(&str, &str)],
    ) -> Result<DalRequest> {
        self.ensure_connected()?;

        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.leave_idle().await;
                return Ok(request);
            }
            reply = self.vipa.display_html(resource, pairs) => reply?,
        };

        let PromptReply { status, selection } = reply;
        match status {
            VipaStatus::UserEntryCancelled => self.publish(DeviceEvent::CancelKeyPressed),
            s if s.is_success() || s.is_cancelled() => {}
            s => {
                self.leave_idle().await;
                return Err(HardwareError::device_status(s.code()));
            }
        }

        request.primary_response_mut().prompt = Some(PromptResult {
            status: Some(status.to_string()),
            value: selection,
        });
        self.leave_idle().await;
        Ok(request)
    }

    async fn quick<F>(&self, token: &CancellationToken, fut: F) -> Result<VipaStatus>
    where
        F: Future<Output = Result<VipaStatus>>,
    {
        self.ensure_connected()?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HardwareError::Cancelled),
            status = fut => status,
        }
    }

    fn record_status(request: &mut DalRequest, status: VipaStatus) -> Result<()> {
        if !status.is_success() {
            return Err(HardwareError::device_status(status.code()));
        }
        request.primary_response_mut().prompt = Some(PromptResult {
            status: Some(status.to_string()),
            value: None,
        });
        Ok(())
    }
}

/// Amount in minor units rendered as dollars and cents.
fn amount_to_dollars(amount: &str) -> Option<String> {
    let cents: u64 = amount.trim().parse().ok()?;
    Some(format!("{}.{:02}", cents / 100, cents % 100))
}

fn payload_str<'a>(request: &'a DalRequest, key: &str) -> Option<&'a str> {
    request
        .first_action()
        .and_then(|action| action.payload.get(key))
        .and_then(serde_json::Value::as_str)
}

impl CardDevice for VerifoneDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Verifone
    }

    fn information(&self) -> DeviceInformation {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn sort_order(&self) -> i32 {
        self.config.sort_order
    }

    fn is_connected(&self) -> bool {
        self.vipa.is_connected()
    }

    #[instrument(skip(self), fields(device = %self.port))]
    async fn probe(&self) -> Result<DeviceInformation> {
        self.restore_link()?;
        let info = self
            .vipa
            .reset_device(ResetFlags::RETURN_SERIAL_NUMBER | ResetFlags::LEAVE_SCREEN_UNCHANGED)
            .await?
            .with_port(self.port.clone());

        if !self.config.supports_model(&info.model) {
            return Err(HardwareError::initialization_failed(format!(
                "unsupported model '{}'",
                info.model
            )));
        }

        info!(
            model = %info.model,
            serial = %info.serial_number,
            firmware = ?info.firmware_version,
            "Verifone device found"
        );
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info.clone();
        Ok(info)
    }

    async fn get_status(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.ensure_connected()?;
        let info = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HardwareError::Cancelled),
            info = self.vipa.reset_device(ResetFlags::RETURN_SERIAL_NUMBER | ResetFlags::LEAVE_SCREEN_UNCHANGED) => info?,
        };
        let info = info.with_port(self.port.clone());
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info.clone();

        request.primary_response_mut().devices.push(info.to_response());
        Ok(request)
    }

    async fn abort_command(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        let status = self.quick(&token, self.vipa.abort()).await?;
        Self::record_status(&mut request, status)?;
        self.leave_idle().await;
        Ok(request)
    }

    async fn manual_card_entry(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.capture_manual_pan(request, token, ManualEntryFlags::PAN | ManualEntryFlags::EXPIRY)
            .await
    }

    async fn present_card(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.ensure_connected()?;
        self.vipa
            .display_message(DisplayMessage::InsertCardWithBeeps, Backlight::On, None)
            .await?;

        let presence = self
            .wait_for_card(&token, |p| p != CardPresence::Absent)
            .await?;
        let Some(presence) = presence else {
            self.leave_idle().await;
            return Ok(request);
        };

        let entry_mode = match presence {
            CardPresence::Swiped => CardEntryMode::Swipe,
            _ => CardEntryMode::Chip,
        };
        debug!(device = %self.port, ?entry_mode, "Card presented");
        request.primary_response_mut().card_data = Some(CapturedCardData {
            entry_mode,
            masked_pan: None,
            expiry: None,
            cvv_captured: false,
        });
        Ok(request)
    }

    async fn get_card_data(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.ensure_connected()?;
        let presence = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(HardwareError::Cancelled),
            presence = self.vipa.card_status() => presence?,
        };

        let entry_mode = match presence {
            CardPresence::Inserted => CardEntryMode::Chip,
            CardPresence::Swiped => CardEntryMode::Swipe,
            CardPresence::Absent => {
                let reply = self.vipa.contactless_status().await?;
                if !reply.status.is_success() || reply.tags().is_empty() {
                    return Err(HardwareError::card_read("no card presented"));
                }
                CardEntryMode::Contactless
            }
        };

        request.primary_response_mut().card_data = Some(CapturedCardData {
            entry_mode,
            masked_pan: None,
            expiry: None,
            cvv_captured: false,
        });
        Ok(request)
    }

    async fn get_manual_pan_data(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.capture_manual_pan(
            request,
            token,
            ManualEntryFlags::PAN | ManualEntryFlags::EXPIRY | ManualEntryFlags::CVV2,
        )
        .await
    }

    async fn get_verify_amount(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        let amount = payload_str(&request, "amount")
            .and_then(amount_to_dollars)
            .ok_or_else(|| HardwareError::invalid_data("verify amount request has no amount"))?;
        self.prompt(request, token, VERIFY_AMOUNT_RESOURCE, &[("amount", amount.as_str())])
            .await
    }

    async fn get_credit_or_debit(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.prompt(request, token, CREDIT_OR_DEBIT_RESOURCE, &[]).await
    }

    async fn get_pin(&self, _request: DalRequest, _token: CancellationToken) -> Result<DalRequest> {
        Err(HardwareError::unsupported("GetPin"))
    }

    async fn get_zip(&self, request: DalRequest, token: CancellationToken) -> Result<DalRequest> {
        self.prompt(request, token, ZIP_RESOURCE, &[("max_length", "5")])
            .await
    }

    async fn remove_card(
        &self,
        request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        self.ensure_connected()?;
        self.vipa
            .display_message(DisplayMessage::RemoveCardWithBeeps, Backlight::On, None)
            .await?;

        let removed = self
            .wait_for_card(&token, |p| p == CardPresence::Absent)
            .await?;
        if removed.is_some() {
            self.publish(DeviceEvent::CardRemoved);
        }
        self.leave_idle().await;
        Ok(request)
    }

    async fn device_ui(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        if let Some(text) = payload_str(&request, "text").map(str::to_string) {
            let status = self
                .quick(
                    &token,
                    self.vipa
                        .display_message(DisplayMessage::Custom, Backlight::On, Some(text.as_str())),
                )
                .await?;
            Self::record_status(&mut request, status)?;
            return Ok(request);
        }

        let Some(resource) = payload_str(&request, "resource").map(str::to_string) else {
            return Err(HardwareError::invalid_data(
                "device UI request names no text or resource",
            ));
        };
        let values: Vec<(String, String)> = request
            .first_action()
            .and_then(|action| action.payload.get("values"))
            .and_then(serde_json::Value::as_object)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let pairs: Vec<(&str, &str)> = values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        self.prompt(request, token, &resource, &pairs).await
    }

    async fn start_pre_swipe_mode(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        let status = self.quick(&token, self.vipa.start_pre_swipe()).await?;
        Self::record_status(&mut request, status)?;
        Ok(request)
    }

    async fn end_pre_swipe_mode(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        let status = self.quick(&token, self.vipa.end_pre_swipe()).await?;
        Self::record_status(&mut request, status)?;
        self.leave_idle().await;
        Ok(request)
    }

    async fn purge_held_card_data(
        &self,
        mut request: DalRequest,
        token: CancellationToken,
    ) -> Result<DalRequest> {
        let status = self.quick(&token, self.vipa.purge_held_card_data()).await?;
        Self::record_status(&mut request, status)?;
        Ok(request)
    }

    #[instrument(skip(self, token), fields(device = %self.port))]
    async fn device_recovery(&self, token: CancellationToken) -> Result<bool> {
        let aborted = self.quick(&token, self.vipa.abort()).await?;
        let idle = self.set_idle().await;
        let recovered = aborted.is_success() && idle.is_ok();
        info!(abort = %aborted, recovered, "Device recovery finished");
        Ok(recovered)
    }

    async fn device_set_idle(&self, token: CancellationToken) -> Result<()> {
        self.ensure_connected()?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(HardwareError::Cancelled),
            result = self.set_idle() => result,
        }
    }
}
