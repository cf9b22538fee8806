//! Core types used throughout boardlink.
//!
//! These are the typed forms of the identifiers and tokens that travel on
//! the wire as plain strings: pin names (`"D13"`), pin modes (`"OUTPUT"`),
//! sensor ids (`"DHT11"`), request ids (`"r7"`) and response status tokens
//! (`"ok"`, `"invalid_pin"`).

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A board pin, either a digital header pin (`D0`..) or an analog input (`A0`..).
///
/// Parsing accepts `D13`, `d13`, `A0`, and a bare number (`13`), which is
/// treated as a digital pin. The index range is not checked here; the board
/// itself answers `invalid_pin` for pins it does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PinName {
    /// Digital pin `D<n>`.
    Digital(u8),
    /// Analog input pin `A<n>`.
    Analog(u8),
}

impl PinName {
    /// Whether this is an analog input pin.
    pub fn is_analog(&self) -> bool {
        matches!(self, PinName::Analog(_))
    }

    /// The numeric index within its bank.
    pub fn index(&self) -> u8 {
        match self {
            PinName::Digital(n) | PinName::Analog(n) => *n,
        }
    }
}

impl fmt::Display for PinName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinName::Digital(n) => write!(f, "D{n}"),
            PinName::Analog(n) => write!(f, "A{n}"),
        }
    }
}

impl FromStr for PinName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::InvalidParameter(format!("invalid pin name: {s:?}"));

        let (bank, digits) = match s.chars().next() {
            Some('D') | Some('d') => ('D', &s[1..]),
            Some('A') | Some('a') => ('A', &s[1..]),
            Some(c) if c.is_ascii_digit() => ('D', s),
            _ => return Err(invalid()),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let index: u8 = digits.parse().map_err(|_| invalid())?;

        Ok(if bank == 'A' {
            PinName::Analog(index)
        } else {
            PinName::Digital(index)
        })
    }
}

impl TryFrom<String> for PinName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PinName> for String {
    fn from(pin: PinName) -> Self {
        pin.to_string()
    }
}

/// Pin direction / pull-up configuration, as sent with `pin_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinMode {
    Input,
    Output,
    InputPullup,
}

impl PinMode {
    /// The wire token for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            PinMode::Input => "INPUT",
            PinMode::Output => "OUTPUT",
            PinMode::InputPullup => "INPUT_PULLUP",
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "INPUT" | "IN" => Ok(PinMode::Input),
            "OUTPUT" | "OUT" => Ok(PinMode::Output),
            "INPUT_PULLUP" | "PULLUP" => Ok(PinMode::InputPullup),
            _ => Err(Error::InvalidParameter(format!("invalid pin mode: {s:?}"))),
        }
    }
}

/// Identifier of a request on the wire (`id` / `response_to`).
///
/// Host-allocated ids look like `r17`, but any string the device echoes is
/// accepted for lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

/// Status token carried by every `response` message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// `"ok"`
    Ok,
    /// `"invalid_pin"`
    InvalidPin,
    /// `"invalid_mode"`
    InvalidMode,
    /// `"unknown_command"`
    UnknownCommand,
    /// Any other token, preserved verbatim.
    Other(String),
}

impl ResponseStatus {
    /// Classify a status token from the wire.
    pub fn from_token(token: &str) -> Self {
        match token {
            "ok" => ResponseStatus::Ok,
            "invalid_pin" => ResponseStatus::InvalidPin,
            "invalid_mode" => ResponseStatus::InvalidMode,
            "unknown_command" => ResponseStatus::UnknownCommand,
            other => ResponseStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::InvalidPin => "invalid_pin",
            ResponseStatus::InvalidMode => "invalid_mode",
            ResponseStatus::UnknownCommand => "unknown_command",
            ResponseStatus::Other(s) => s,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensor identifier as understood by the sketch (e.g. `DHT11`, `ULTRASONIC`).
///
/// Firmware revisions disagree on naming; the legacy combined name
/// `B24_TEMP_HUMIDITY` is normalized to `DHT11` on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SensorId(String);

impl SensorId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        match id.as_str() {
            "B24_TEMP_HUMIDITY" => SensorId("DHT11".to_string()),
            _ => SensorId(id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SensorId {
    fn from(s: String) -> Self {
        SensorId::new(s)
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        SensorId::new(s)
    }
}

impl From<SensorId> for String {
    fn from(id: SensorId) -> Self {
        id.0
    }
}
