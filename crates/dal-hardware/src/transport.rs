//! Serial transport for VIPA terminals.
//!
//! Terminals enumerate as a serial port (USB CDC or RS-232) running 8N1
//! without flow control. OS-level enumeration is out of scope: the port name
//! comes from configuration.

use std::time::Duration;

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use dal_core::config::{SerialConfig, VerifoneConfig};

use crate::connection::VipaConnection;
use crate::error::{HardwareError, Result};
use crate::events::EventPublisher;
use crate::verifone::{Reconnector, VerifoneDevice};

/// Open `port_name` with the terminal's line settings.
///
/// # Errors
///
/// Returns `HardwareError::CommunicationError` if the port cannot be opened.
pub fn open_serial(port_name: &str, baud_rate: u32) -> Result<SerialStream> {
    tokio_serial::new(port_name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| HardwareError::communication(format!("failed to open {port_name}: {e}")))
}

/// Open the configured port and wrap it in a Verifone driver.
///
/// Must be called inside a Tokio runtime. The device still needs a probe;
/// a probe after a disconnect reopens the same port.
///
/// # Errors
///
/// Returns `HardwareError::InitializationFailed` when no port is configured,
/// or the error of [`open_serial`].
pub fn connect_verifone(
    serial: &SerialConfig,
    verifone: VerifoneConfig,
    device_result_timeout: Duration,
    events: EventPublisher,
) -> Result<VerifoneDevice> {
    let port_name = serial
        .port_name
        .as_deref()
        .ok_or_else(|| HardwareError::initialization_failed("no serial port configured"))?;
    let stream = open_serial(port_name, serial.baud_rate)?;
    info!(port = port_name, baud = serial.baud_rate, "Serial port opened");

    let connection = VipaConnection::open(port_name, stream);
    let reconnector = {
        let port_name = port_name.to_string();
        let baud_rate = serial.baud_rate;
        Reconnector::new(move || {
            let stream = open_serial(&port_name, baud_rate)?;
            Ok(VipaConnection::open(port_name.clone(), stream))
        })
    };
    Ok(
        VerifoneDevice::new(connection, verifone, device_result_timeout, events)
            .with_node_address(serial.node_address)
            .with_reconnector(reconnector),
    )
}
