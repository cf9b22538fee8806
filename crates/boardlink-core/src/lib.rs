//! boardlink-core: Core traits, types, and error definitions for boardlink.
//!
//! This crate defines the pieces every other boardlink crate shares: the
//! byte-stream [`Transport`] abstraction, the typed pin and sensor
//! identifiers used on the wire, the [`BoardEvent`]s published for
//! unsolicited device messages, and the [`Error`] taxonomy.
//!
//! # Key types
//!
//! - [`Transport`] -- full-duplex byte stream to a board
//! - [`BoardEvent`] / [`EventTag`] -- unsolicited notifications and their tags
//! - [`PinName`], [`PinMode`], [`SensorId`], [`RequestId`], [`ResponseStatus`]
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::{BoardEvent, EventTag, PinSnapshot, PinStates, PinUpdate, SensorReading};
pub use transport::Transport;
pub use types::*;
