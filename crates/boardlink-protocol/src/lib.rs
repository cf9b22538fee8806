//! Wire protocol for boardlink: newline-delimited JSON.
//!
//! Every message in either direction is one JSON object terminated by `\n`.
//! Requests carry a host-chosen `id` and a `command`; the board answers with
//! a `response` echoing the id in `response_to`, and may push unsolicited
//! messages (`pin_update`, `sensor_update`, `status`, ...) at any time.
//!
//! # Architecture
//!
//! - [`framing`] -- splits the inbound byte stream into bounded lines
//! - [`codec`] -- encodes [`Command`]s and classifies inbound lines
//!
//! Everything here is pure parsing; no I/O is performed.

pub mod codec;
pub mod framing;

pub use codec::{
    Command, CommandClass, InboundMessage, Response, SensorConfig, encode_request, parse_message,
};
pub use framing::{Frame, LineBuffer, MAX_LINE};
