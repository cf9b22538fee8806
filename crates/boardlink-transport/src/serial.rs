//! Serial port transport for board communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for USB virtual COM ports. Arduino-class boards
//! enumerate as `/dev/ttyACM*` / `/dev/ttyUSB*` on Linux,
//! `/dev/cu.usbmodem*` on macOS and `COM*` on Windows, and the boardlink
//! sketch runs at 115200 baud, 8N1.
//!
//! Opening the port asserts DTR, which resets an Uno. The sketch needs a
//! moment to boot before it answers; the client builder waits for a
//! configurable settle delay after opening.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use boardlink_core::error::{Error, Result};
use boardlink_core::transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

/// Default baud rate of the boardlink sketch.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial port configuration.
///
/// Defaults match the boardlink sketch: 115200 baud, 8 data bits, 1 stop
/// bit, no parity, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// An open serial connection to a board.
///
/// The client splits this into read and write halves; dropping both halves
/// closes the port.
pub struct SerialTransport {
    port: SerialStream,
    port_name: String,
}

impl SerialTransport {
    /// Open a serial port with the given baud rate and 8N1 framing.
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig {
            baud_rate,
            ..Default::default()
        };
        Self::open_with_config(port, config).await
    }

    /// Open a serial port with full configuration control.
    pub async fn open_with_config(port: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            port = %port,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "Opening serial port"
        );

        let serial_stream = tokio_serial::new(port, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {port}: {e}"))
            })?;

        tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial port opened");

        Ok(Self {
            port: serial_stream,
            port_name: port.to_string(),
        })
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.port_name
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.port).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.port).poll_shutdown(cx)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        tracing::debug!(port = %self.port_name, "Serial port closed");
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or COM name.
    pub name: String,
    /// USB vendor/product id, if the port is a USB device.
    pub usb_id: Option<(u16, u16)>,
    /// Manufacturer or product string reported by USB, if any.
    pub description: Option<String>,
}

impl PortInfo {
    /// Whether the USB ids belong to a common Arduino or clone USB bridge
    /// (Arduino SA, CH340, FTDI, CP210x).
    pub fn looks_like_arduino(&self) -> bool {
        matches!(
            self.usb_id,
            Some((0x2341, _)) | Some((0x2A03, _)) | Some((0x1A86, 0x7523))
                | Some((0x0403, 0x6001)) | Some((0x10C4, 0xEA60))
        )
    }
}

/// List serial ports present on the host.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("failed to enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|p| {
            let (usb_id, description) = match p.port_type {
                SerialPortType::UsbPort(usb) => {
                    (Some((usb.vid, usb.pid)), usb.product.or(usb.manufacturer))
                }
                _ => (None, None),
            };
            PortInfo {
                name: p.port_name,
                usb_id,
                description,
            }
        })
        .collect())
}
