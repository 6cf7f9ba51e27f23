//! # Transport Layer
//!
//! The link between the two multiplexers is any reliable, ordered byte
//! stream. In production it is a serial port; TCP variants exist so the
//! tunnel can be exercised without hardware.
//!
//! ## Device syntax
//! - `/dev/ttyUSB0`, `COM3`: serial port opened at the configured baud rate
//! - `tcp://host:port`: connect to a peer
//! - `tcp-listen://host:port`: accept exactly one peer

pub mod serial;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument};

use crate::config::TransportConfig;
use crate::error::{Result, TunnelError};

/// Byte stream carrying the framed link
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

const TCP_PREFIX: &str = "tcp://";
const TCP_LISTEN_PREFIX: &str = "tcp-listen://";

/// Open the transport named by `config.device`
#[instrument(skip(config), fields(device = %config.device))]
pub async fn open(config: &TransportConfig) -> Result<BoxedTransport> {
    let device = config.device.trim();

    if let Some(addr) = device.strip_prefix(TCP_LISTEN_PREFIX) {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TunnelError::TransportError(format!("Failed to bind {addr}: {e}"))
        })?;
        info!(addr, "Waiting for peer");
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "Peer connected");
        return Ok(Box::new(stream));
    }

    if let Some(addr) = device.strip_prefix(TCP_PREFIX) {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            TunnelError::TransportError(format!("Failed to connect to {addr}: {e}"))
        })?;
        stream.set_nodelay(true)?;
        info!(addr, "Connected to peer");
        return Ok(Box::new(stream));
    }

    let port = serial::open(device, config.baud_rate)?;
    Ok(Box::new(port))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::DEFAULT_BAUD_RATE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(device: String) -> TransportConfig {
        TransportConfig {
            device,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    #[tokio::test]
    async fn tcp_transport_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"link").await.unwrap();
        });

        let mut transport = open(&config(format!("tcp://{addr}"))).await.unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"link");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connect_failure_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = open(&config(format!("tcp://127.0.0.1:{port}"))).await;
        assert!(matches!(result, Err(TunnelError::TransportError(_))));
    }

    #[tokio::test]
    async fn missing_serial_device_fails() {
        let result = open(&config("/dev/serial-mux-does-not-exist".to_string())).await;
        assert!(matches!(result, Err(TunnelError::TransportError(_))));
    }
}
