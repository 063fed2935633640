//! Device event publication.
//!
//! Drivers report events that happen outside the command/response flow
//! (cancel key pressed, card removed, disconnect) on a bounded mpsc channel.
//! The sub-workflow controller drains the receiving end after every device
//! call.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use dal_core::constants::DEVICE_EVENT_CHANNEL_CAPACITY;
use dal_core::{DeviceEvent, DeviceEventNotice};

pub type EventReceiver = mpsc::Receiver<DeviceEventNotice>;

/// Create a publisher and the receiver it feeds.
pub fn event_channel() -> (EventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::channel(DEVICE_EVENT_CHANNEL_CAPACITY);
    (EventPublisher { sender: Some(tx) }, rx)
}

/// Cloneable sending side handed to drivers.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    sender: Option<mpsc::Sender<DeviceEventNotice>>,
}

impl EventPublisher {
    /// Publisher that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Publish without waiting. A full or closed channel drops the event.
    pub fn publish(&self, event: DeviceEvent, serial_number: Option<String>) {
        let Some(sender) = &self.sender else {
            return;
        };
        debug!(?event, serial = ?serial_number, "Publishing device event");
        if let Err(e) = sender.try_send(DeviceEventNotice::new(event, serial_number)) {
            warn!(?event, error = %e, "Device event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_published_event_is_received() {
        let (publisher, mut rx) = event_channel();
        publisher.publish(DeviceEvent::CancelKeyPressed, Some("CEEEDEADBEEF".into()));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.event, DeviceEvent::CancelKeyPressed);
        assert_eq!(notice.serial_number.as_deref(), Some("CEEEDEADBEEF"));
    }

    #[test]
    fn test_disabled_publisher_is_silent() {
        EventPublisher::disabled().publish(DeviceEvent::CardRemoved, None);
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (publisher, rx) = event_channel();
        drop(rx);
        publisher.publish(DeviceEvent::CardInserted, None);
    }
}
