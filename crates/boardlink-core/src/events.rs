//! Unsolicited board event types.
//!
//! Everything the board sends that is not a `response` to a pending request
//! becomes a [`BoardEvent`] and is published by the client's event fan-out
//! to the subscribers of its [`EventTag`]. Connection state changes and
//! undecodable lines travel through the same channel.

use std::fmt;

use serde::Deserialize;

/// A `pin_update` broadcast: a pin changed value (after a write, a read, or
/// an input edge reported by the sketch).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PinUpdate {
    /// Pin name as sent by the board (`"D13"`, `"A0"`).
    pub pin_name: String,
    /// Digital level (0/1) or raw analog reading.
    pub value: i64,
}

/// A `sensor_update` push from a plug-in sensor.
///
/// Different sensors fill different fields: climate sensors send `value`
/// and `unit`, vibration modules send `intensity` and `vibrating`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorReading {
    /// Sensor channel name (e.g. `B24_TEMP`, `B24_HUMIDITY`, `ULTRASONIC`).
    pub sensor: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub intensity: Option<f64>,
    #[serde(default)]
    pub vibrating: Option<bool>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One entry of a `pin_states` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PinSnapshot {
    #[serde(alias = "pin_name")]
    pub pin: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub value: i64,
}

/// A `pin_states` broadcast: the full digital and analog pin table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct PinStates {
    #[serde(default)]
    pub digital: Vec<PinSnapshot>,
    #[serde(default)]
    pub analog: Vec<PinSnapshot>,
}

/// An event published to subscribers.
///
/// Subscribe via `BoardClient::subscribe()` with the [`EventTag`]s of
/// interest. Within a single subscriber, events arrive in the order their
/// lines were read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// A pin changed value.
    PinUpdate(PinUpdate),

    /// A sensor pushed a reading.
    SensorUpdate(SensorReading),

    /// Informational `status` notice from the sketch (boot banner, etc.).
    Status {
        message: String,
    },

    /// Unsolicited `error` notice from the sketch.
    DeviceError {
        message: String,
    },

    /// Snapshot of all pin states.
    PinStates(PinStates),

    /// Device capability descriptor, kept as raw JSON.
    Config(serde_json::Value),

    /// A well-formed JSON object with an unrecognized or missing `type`.
    Unknown {
        /// The `type` field, if present.
        kind: Option<String>,
        /// The full message.
        raw: serde_json::Value,
    },

    /// A line that could not be decoded. The reader loop carries on.
    ParseError {
        /// The offending line (lossily decoded, whitespace-trimmed).
        line: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The client connected to the board.
    Connected,

    /// The connection to the board was lost or closed.
    Disconnected,
}

impl BoardEvent {
    /// The tag subscribers use to select this event.
    pub fn tag(&self) -> EventTag {
        match self {
            BoardEvent::PinUpdate(_) => EventTag::PinUpdate,
            BoardEvent::SensorUpdate(_) => EventTag::SensorUpdate,
            BoardEvent::Status { .. } => EventTag::Status,
            BoardEvent::DeviceError { .. } => EventTag::Error,
            BoardEvent::PinStates(_) => EventTag::PinStates,
            BoardEvent::Config(_) => EventTag::Config,
            BoardEvent::Unknown { .. } => EventTag::Unknown,
            BoardEvent::ParseError { .. } => EventTag::ParseError,
            BoardEvent::Connected | BoardEvent::Disconnected => EventTag::Connection,
        }
    }
}

/// Selector for [`BoardEvent`] subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    PinUpdate,
    SensorUpdate,
    Status,
    Error,
    PinStates,
    Config,
    Unknown,
    ParseError,
    Connection,
}

impl EventTag {
    /// Every tag, for catch-all subscribers such as loggers.
    pub const ALL: [EventTag; 9] = [
        EventTag::PinUpdate,
        EventTag::SensorUpdate,
        EventTag::Status,
        EventTag::Error,
        EventTag::PinStates,
        EventTag::Config,
        EventTag::Unknown,
        EventTag::ParseError,
        EventTag::Connection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTag::PinUpdate => "pin_update",
            EventTag::SensorUpdate => "sensor_update",
            EventTag::Status => "status",
            EventTag::Error => "error",
            EventTag::PinStates => "pin_states",
            EventTag::Config => "config",
            EventTag::Unknown => "unknown",
            EventTag::ParseError => "parse_error",
            EventTag::Connection => "connection",
        }
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
