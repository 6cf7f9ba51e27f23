//! Serial port transport

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::error::{Result, TunnelError};

/// Open `device` at `baud_rate`, 8N1 without flow control
pub fn open(device: &str, baud_rate: u32) -> Result<SerialStream> {
    let port = tokio_serial::new(device, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| TunnelError::TransportError(format!("Failed to open serial port {device}: {e}")))?;

    info!(device, baud_rate, "Opened serial port");
    Ok(port)
}
