//! BoardBuilder -- fluent builder for constructing [`BoardClient`] instances.
//!
//! Separates configuration from construction so that callers can set up
//! serial port parameters and timeouts before the port is opened.
//!
//! # Example
//!
//! ```no_run
//! use boardlink_client::builder::BoardBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> boardlink_core::Result<()> {
//! let board = BoardBuilder::new()
//!     .serial_port("/dev/ttyACM0")
//!     .sensor_timeout(Duration::from_secs(5))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use boardlink_core::error::{Error, Result};
use boardlink_core::transport::Transport;
use boardlink_transport::{DEFAULT_BAUD_RATE, SerialConfig, SerialTransport};

use crate::client::{BoardClient, ClientOptions, TimeoutPolicy};

/// Delay after opening the port before the first command.
///
/// Opening the port toggles DTR, which resets most Arduino boards; the
/// bootloader swallows anything sent before the sketch starts.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Fluent builder for [`BoardClient`].
pub struct BoardBuilder {
    serial_port: Option<String>,
    baud_rate: u32,
    settle_delay: Duration,
    options: ClientOptions,
}

impl Default for BoardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardBuilder {
    pub fn new() -> Self {
        BoardBuilder {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            settle_delay: DEFAULT_SETTLE_DELAY,
            options: ClientOptions::default(),
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyACM0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate (default: 115200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Time to wait after opening the port (default: 500ms).
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Replace all per-class timeouts.
    pub fn timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.options.timeouts = timeouts;
        self
    }

    /// Timeout for pin and servo commands (default: 1s).
    pub fn pin_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.pin = timeout;
        self
    }

    /// Timeout for sensor reads (default: 3s).
    pub fn sensor_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.sensor = timeout;
        self
    }

    /// Timeout for sensor configuration commands (default: 2s).
    pub fn config_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.config = timeout;
        self
    }

    /// Timeout for `get_pin_states` and `reset` (default: 2s).
    pub fn system_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeouts.system = timeout;
        self
    }

    /// Longest accepted inbound line in bytes (default: 8 KiB).
    pub fn max_line(mut self, bytes: usize) -> Self {
        self.options.max_line = bytes;
        self
    }

    /// Build a [`BoardClient`] over a caller-provided transport.
    ///
    /// No settle delay is applied; the transport is assumed ready. This is
    /// the entry point for tests and for the simulator.
    pub fn build_with_transport<T: Transport>(self, transport: T) -> Result<BoardClient> {
        if self.options.max_line == 0 {
            return Err(Error::InvalidParameter("max_line must be non-zero".into()));
        }
        Ok(BoardClient::connect(transport, self.options))
    }

    /// Open the serial port and build a [`BoardClient`] over it.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<BoardClient> {
        let port = self
            .serial_port
            .clone()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;

        let config = SerialConfig {
            baud_rate: self.baud_rate,
            ..SerialConfig::default()
        };
        let transport = SerialTransport::open_with_config(&port, config).await?;

        if !self.settle_delay.is_zero() {
            tracing::debug!(port = %port, delay_ms = self.settle_delay.as_millis() as u64, "waiting for board to settle");
            tokio::time::sleep(self.settle_delay).await;
        }

        self.build_with_transport(transport)
    }
}
