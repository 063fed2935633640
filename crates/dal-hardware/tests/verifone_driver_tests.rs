//! Verifone driver flows against a scripted terminal.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use dal_core::config::VerifoneConfig;
use dal_core::{CardEntryMode, DalRequest, DeviceAction, DeviceEvent};
use dal_hardware::{
    CardDevice, EventPublisher, HardwareError, Reconnector, VerifoneDevice, event_channel,
};
use dal_protocol::{DisplayMessage, VipaCommandType};
use tokio_util::sync::CancellationToken;

const RESULT_TIMEOUT: Duration = Duration::from_secs(2);

fn device(responder: Responder, events: EventPublisher) -> (VerifoneDevice, Received) {
    let (connection, received) = spawn_terminal(responder);
    let device = VerifoneDevice::new(connection, VerifoneConfig::default(), RESULT_TIMEOUT, events);
    (device, received)
}

fn idle_display_sent(received: &Received) -> bool {
    received
        .all()
        .iter()
        .any(|c| c.is(VipaCommandType::DisplayMessage) && c.p1 == DisplayMessage::Idle.as_byte())
}

#[tokio::test]
async fn test_probe_reads_identity() {
    let (device, received) = device(standard_responder(), EventPublisher::disabled());

    let info = device.probe().await.unwrap();

    assert_eq!(info.manufacturer, "Verifone");
    assert_eq!(info.model, TEST_MODEL);
    assert_eq!(info.serial_number, TEST_SERIAL);
    assert_eq!(info.port.as_deref(), Some("FAKE0"));
    assert_eq!(device.information(), info);
    assert_eq!(received.count(VipaCommandType::ResetDevice), 1);
}

#[tokio::test]
async fn test_probe_rejects_unsupported_model() {
    let responder = responder_with(VipaCommandType::ResetDevice, |command| {
        reply(command, &device_info(TEST_SERIAL, "VX820"), 0x9000)
    });
    let (device, _received) = device(responder, EventPublisher::disabled());

    let err = device.probe().await.unwrap_err();
    assert!(matches!(err, HardwareError::InitializationFailed { .. }));
    assert!(device.information().serial_number.is_empty());
}

#[tokio::test]
async fn test_get_status_reports_device() {
    let (device, _received) = device(standard_responder(), EventPublisher::disabled());

    let request = device
        .get_status(
            DalRequest::for_action(DeviceAction::GetStatus),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let response = request.primary_response().unwrap();
    assert_eq!(response.devices.len(), 1);
    assert_eq!(response.devices[0].serial_number.as_deref(), Some(TEST_SERIAL));
    assert_eq!(response.devices[0].model.as_deref(), Some(TEST_MODEL));
}

#[tokio::test]
async fn test_manual_entry_returns_masked_card() {
    let (device, received) = device(standard_responder(), EventPublisher::disabled());
    device.probe().await.unwrap();

    let request = device
        .manual_card_entry(
            DalRequest::for_action(DeviceAction::ManualCardEntry),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let card = request
        .primary_response()
        .and_then(|r| r.card_data.clone())
        .unwrap();
    assert_eq!(card.entry_mode, CardEntryMode::Manual);
    assert_eq!(card.masked_pan.as_deref(), Some("411111******1111"));
    assert_eq!(card.expiry.as_deref(), Some("2512"));
    assert!(idle_display_sent(&received));
}

#[tokio::test]
async fn test_cancel_key_publishes_event() {
    let responder = responder_with(VipaCommandType::ManualPanEntry, |command| {
        reply(command, &[], 0x9F43)
    });
    let (publisher, mut events) = event_channel();
    let (device, received) = device(responder, publisher);
    device.probe().await.unwrap();

    let request = device
        .manual_card_entry(
            DalRequest::for_action(DeviceAction::ManualCardEntry),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(request.primary_response().is_none_or(|r| r.card_data.is_none()));
    let notice = events.try_recv().unwrap();
    assert_eq!(notice.event, DeviceEvent::CancelKeyPressed);
    assert_eq!(notice.serial_number.as_deref(), Some(TEST_SERIAL));
    assert!(idle_display_sent(&received));
}

#[tokio::test]
async fn test_token_cancel_sets_idle_without_data() {
    // Terminal waits on the cardholder forever.
    let responder = responder_with(VipaCommandType::ManualPanEntry, |_| Vec::new());
    let (device, received) = device(responder, EventPublisher::disabled());
    device.probe().await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let request = device
        .manual_card_entry(DalRequest::for_action(DeviceAction::ManualCardEntry), token)
        .await
        .unwrap();

    assert!(request.primary_response().is_none_or(|r| r.card_data.is_none()));
    assert_eq!(received.count(VipaCommandType::CloseContactlessReader), 1);
    assert!(idle_display_sent(&received));
    // The abandoned entry must not block the next command.
    device
        .get_status(
            DalRequest::for_action(DeviceAction::GetStatus),
            CancellationToken::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_terminal_error_status_fails_entry() {
    let responder = responder_with(VipaCommandType::ManualPanEntry, |command| {
        reply(command, &[], 0x6700)
    });
    let (device, received) = device(responder, EventPublisher::disabled());

    let err = device
        .manual_card_entry(
            DalRequest::for_action(DeviceAction::ManualCardEntry),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HardwareError::DeviceStatus { status_word: 0x6700, .. }));
    assert!(idle_display_sent(&received));
}

#[tokio::test]
async fn test_get_pin_is_unsupported() {
    let (device, received) = device(standard_responder(), EventPublisher::disabled());

    let err = device
        .get_pin(
            DalRequest::for_action(DeviceAction::GetPin),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HardwareError::Unsupported { .. }));
    assert!(received.all().is_empty());
}

#[tokio::test]
async fn test_verify_amount_sends_dollars() {
    let (device, received) = device(standard_responder(), EventPublisher::disabled());

    let mut request = DalRequest::for_action(DeviceAction::GetVerifyAmount);
    request.actions[0].payload = serde_json::json!({ "amount": "1999" });

    let request = device
        .get_verify_amount(request, CancellationToken::new())
        .await
        .unwrap();

    let prompt = request
        .primary_response()
        .and_then(|r| r.prompt.clone())
        .unwrap();
    assert!(prompt.status.unwrap().starts_with("Success"));
    assert_eq!(received.count(VipaCommandType::DisplayHtml), 1);
}

#[tokio::test]
async fn test_recovery_aborts_and_sets_idle() {
    let (device, received) = device(standard_responder(), EventPublisher::disabled());

    let recovered = device
        .device_recovery(CancellationToken::new())
        .await
        .unwrap();

    assert!(recovered);
    assert_eq!(received.count(VipaCommandType::Abort), 1);
    assert!(idle_display_sent(&received));
}

async fn wait_disconnected(device: &VerifoneDevice) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while device.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link still up");
}

#[tokio::test]
async fn test_probe_reopens_dropped_link() {
    let (connection, _first, hangup) = spawn_closable_terminal(standard_responder());
    let reopened = Arc::new(AtomicUsize::new(0));
    let reconnector = {
        let reopened = Arc::clone(&reopened);
        Reconnector::new(move || {
            reopened.fetch_add(1, Ordering::SeqCst);
            let (connection, _received) = spawn_terminal(standard_responder());
            Ok(connection)
        })
    };
    let device = VerifoneDevice::new(
        connection,
        VerifoneConfig::default(),
        RESULT_TIMEOUT,
        EventPublisher::disabled(),
    )
    .with_reconnector(reconnector);
    device.probe().await.unwrap();
    assert_eq!(reopened.load(Ordering::SeqCst), 0);

    hangup.cancel();
    wait_disconnected(&device).await;

    let info = device.probe().await.unwrap();
    assert_eq!(reopened.load(Ordering::SeqCst), 1);
    assert!(device.is_connected());
    assert_eq!(info.serial_number, TEST_SERIAL);
}

#[tokio::test]
async fn test_probe_without_reconnector_stays_offline() {
    let (connection, _received, hangup) = spawn_closable_terminal(standard_responder());
    let device = VerifoneDevice::new(
        connection,
        VerifoneConfig::default(),
        RESULT_TIMEOUT,
        EventPublisher::disabled(),
    );

    hangup.cancel();
    wait_disconnected(&device).await;

    assert!(device.probe().await.unwrap_err().is_disconnect());
}
