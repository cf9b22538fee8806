//! # boardlink -- host-side control of Arduino boards over serial
//!
//! `boardlink` talks to a sketch that exchanges newline-delimited JSON over
//! a USB serial port. Commands go out with a host-chosen `id`; the board
//! answers with a `response` naming that id in `response_to`, and pushes
//! pin and sensor notifications whenever it likes. The client correlates
//! the two streams so that any number of tasks can issue commands at once.
//!
//! ## Quick Start
//!
//! ```no_run
//! use boardlink::{BoardBuilder, EventTag, PinMode, PinName};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let board = BoardBuilder::new()
//!         .serial_port("/dev/ttyACM0")
//!         .build()
//!         .await?;
//!
//!     let mut pins = board.subscribe(&[EventTag::PinUpdate]);
//!
//!     board.pin_mode(PinName::Digital(13), PinMode::Output).await?;
//!     board.digital_write(PinName::Digital(13), true).await?;
//!     println!("A0 = {}", board.analog_read(PinName::Analog(0)).await?);
//!
//!     if let Some(event) = pins.recv().await {
//!         println!("{:?}", event);
//!     }
//!     board.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                    | Purpose                                         |
//! |--------------------------|-------------------------------------------------|
//! | `boardlink-core`         | [`Transport`], events, pin/sensor types, errors |
//! | `boardlink-protocol`     | Line framing and the JSON codec                 |
//! | `boardlink-transport`    | Serial port transport and port discovery        |
//! | `boardlink-client`       | [`BoardClient`], subscriptions, sequences       |
//! | `boardlink-test-harness` | Mock board and simulator                        |
//! | **`boardlink`**          | This facade crate -- re-exports everything      |
//!
//! ## Feature Flags
//!
//! | Feature     | Enables                                  | Default |
//! |-------------|------------------------------------------|---------|
//! | `simulator` | [`sim`] module (virtual Uno, mock board) | yes     |

pub use boardlink_client::*;
pub use boardlink_core::*;

/// Wire format: framing and message codec.
pub mod protocol {
    pub use boardlink_protocol::*;
}

/// Serial port transport.
pub mod transport {
    pub use boardlink_transport::*;
}

/// In-process virtual board and scripted mock board.
#[cfg(feature = "simulator")]
pub mod sim {
    pub use boardlink_test_harness::*;
}

/// Serial ports that look like an Arduino or a common clone USB bridge.
///
/// Ports without USB ids (built-in UARTs, Bluetooth) are left out; use
/// [`transport::available_ports`] for the full list.
pub fn detect_boards() -> Result<Vec<transport::PortInfo>> {
    let ports: Vec<_> = transport::available_ports()?
        .into_iter()
        .filter(|p| p.looks_like_arduino())
        .collect();
    tracing::debug!(count = ports.len(), "detected candidate boards");
    Ok(ports)
}
