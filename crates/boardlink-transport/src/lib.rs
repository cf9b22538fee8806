//! Transport implementations for boardlink.
//!
//! This crate provides [`SerialTransport`], the [`Transport`](boardlink_core::Transport)
//! implementation for USB virtual COM ports (Arduino Uno, Nano, Mega and
//! clones), and [`available_ports`] for listing candidate ports.
//!
//! # Example
//!
//! ```no_run
//! use boardlink_transport::SerialTransport;
//!
//! # async fn example() -> boardlink_core::Result<()> {
//! let transport = SerialTransport::open("/dev/ttyACM0", 115200).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{
    DEFAULT_BAUD_RATE, DataBits, FlowControl, Parity, PortInfo, SerialConfig, SerialTransport,
    StopBits, available_ports,
};
