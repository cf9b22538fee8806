//! Board JSON command/response/event encoding and decoding.
//!
//! # Line formats
//!
//! ```text
//! Request:   {"id":"r7","command":"digital_write","pin":"D13","value":1}\n
//! Response:  {"type":"response","status":"ok","response_to":"r7","value":1}\n
//! Event:     {"type":"pin_update","pin_name":"D13","value":1}\n
//! ```
//!
//! Older sketches answer with `id` instead of `response_to` and push
//! `sensor_data` instead of `sensor_update`; both spellings are accepted.

use boardlink_core::{
    BoardEvent, Error, PinMode, PinName, PinStates, PinUpdate, RequestId, ResponseStatus, Result,
    SensorId, SensorReading,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// One entry of a `configure_sensors` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sensor_type: SensorId,
    /// Sensor-specific pin assignment, e.g. `{"trig":"D7","echo":"D8"}`.
    pub pin_config: Value,
}

/// A command the board understands.
///
/// Serializes to the request body without the `id`, which is added by
/// [`encode_request`] when the client allocates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    PinMode { pin: PinName, mode: PinMode },
    DigitalWrite { pin: PinName, value: u8 },
    DigitalRead { pin: PinName },
    AnalogRead { pin: PinName },
    /// PWM duty cycle, 0..=255.
    AnalogWrite { pin: PinName, value: u8 },
    ServoAttach { pin: PinName },
    /// Servo angle in degrees, 0..=180.
    ServoWrite { pin: PinName, angle: u8 },
    ServoDetach { pin: PinName },
    ReadSensor { sensor: SensorId },
    ConfigureSensorPin { sensor_type: SensorId, pin_config: Value },
    ConfigureSensors { sensors: Vec<SensorConfig> },
    GetPinStates,
    /// Drive the B37 output module.
    WriteB37 { value: u8 },
    Reset,
}

/// Coarse command classes, used to pick default timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Single pin operations; the sketch answers these immediately.
    Pin,
    /// Sensor reads, which may block the sketch for a conversion.
    Sensor,
    /// Sensor and pin configuration.
    Config,
    /// Board-wide queries and reset.
    System,
}

impl Command {
    /// The wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::PinMode { .. } => "pin_mode",
            Command::DigitalWrite { .. } => "digital_write",
            Command::DigitalRead { .. } => "digital_read",
            Command::AnalogRead { .. } => "analog_read",
            Command::AnalogWrite { .. } => "analog_write",
            Command::ServoAttach { .. } => "servo_attach",
            Command::ServoWrite { .. } => "servo_write",
            Command::ServoDetach { .. } => "servo_detach",
            Command::ReadSensor { .. } => "read_sensor",
            Command::ConfigureSensorPin { .. } => "configure_sensor_pin",
            Command::ConfigureSensors { .. } => "configure_sensors",
            Command::GetPinStates => "get_pin_states",
            Command::WriteB37 { .. } => "write_b37",
            Command::Reset => "reset",
        }
    }

    pub fn class(&self) -> CommandClass {
        match self {
            Command::PinMode { .. }
            | Command::DigitalWrite { .. }
            | Command::DigitalRead { .. }
            | Command::AnalogRead { .. }
            | Command::AnalogWrite { .. }
            | Command::ServoAttach { .. }
            | Command::ServoWrite { .. }
            | Command::ServoDetach { .. }
            | Command::WriteB37 { .. } => CommandClass::Pin,
            Command::ReadSensor { .. } => CommandClass::Sensor,
            Command::ConfigureSensorPin { .. } | Command::ConfigureSensors { .. } => {
                CommandClass::Config
            }
            Command::GetPinStates | Command::Reset => CommandClass::System,
        }
    }

    /// Check parameter ranges that the type system does not enforce.
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::DigitalWrite { value, .. } if *value > 1 => Err(Error::InvalidParameter(
                format!("digital value must be 0 or 1, got {value}"),
            )),
            Command::ServoWrite { angle, .. } if *angle > 180 => Err(Error::InvalidParameter(
                format!("servo angle must be 0..=180, got {angle}"),
            )),
            Command::ConfigureSensorPin { pin_config, .. } if !pin_config.is_object() => Err(
                Error::InvalidParameter("pin_config must be a JSON object".into()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize)]
struct RequestRef<'a> {
    id: &'a RequestId,
    #[serde(flatten)]
    command: &'a Command,
}

#[derive(Deserialize)]
struct RequestOwned {
    id: RequestId,
    #[serde(flatten)]
    command: Command,
}

/// Encode a request line: `{"id":..,"command":..,...}\n`.
pub fn encode_request(id: &RequestId, command: &Command) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&RequestRef { id, command })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode a request line, as the device side sees it.
///
/// Used by the mock board and the simulator; the client never receives
/// requests.
pub fn decode_request(line: &str) -> Result<(RequestId, Command)> {
    let req: RequestOwned = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("invalid request: {e}")))?;
    Ok((req.id, req.command))
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// A decoded `response` message.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The request this answers. `None` if the board sent neither
    /// `response_to` nor `id`; such a response cannot be correlated.
    pub response_to: Option<RequestId>,
    pub status: ResponseStatus,
    pub value: Option<Value>,
}

impl Response {
    /// Build the wire object for this response (used by the device side).
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::from("response"));
        obj.insert("status".into(), Value::from(self.status.as_str()));
        if let Some(id) = &self.response_to {
            obj.insert("response_to".into(), Value::from(id.as_str()));
        }
        if let Some(value) = &self.value {
            obj.insert("value".into(), value.clone());
        }
        Value::Object(obj)
    }
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to a pending request.
    Response(Response),
    /// Anything else, ready to publish.
    Event(BoardEvent),
}

#[derive(Deserialize)]
struct Notice {
    #[serde(default)]
    message: String,
}

/// Parse one inbound line.
///
/// Returns [`Error::Protocol`] for lines that are not JSON objects or whose
/// known `type` carries malformed fields. Objects with an unknown or missing
/// `type` decode to [`BoardEvent::Unknown`].
pub fn parse_message(line: &str) -> Result<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty line".into()));
    }

    let value: Value =
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("invalid JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(Error::Protocol("expected a JSON object".into()));
    };

    let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);
    let event = match kind.as_deref() {
        Some("response") => return parse_response(obj).map(InboundMessage::Response),
        Some("pin_update") => BoardEvent::PinUpdate(typed::<PinUpdate>(obj, "pin_update")?),
        Some("sensor_update") | Some("sensor_data") => {
            BoardEvent::SensorUpdate(typed::<SensorReading>(obj, "sensor_update")?)
        }
        Some("status") => BoardEvent::Status {
            message: typed::<Notice>(obj, "status")?.message,
        },
        Some("error") => BoardEvent::DeviceError {
            message: typed::<Notice>(obj, "error")?.message,
        },
        Some("pin_states") => BoardEvent::PinStates(typed::<PinStates>(obj, "pin_states")?),
        Some("config") => BoardEvent::Config(Value::Object(obj)),
        _ => BoardEvent::Unknown {
            kind: kind.clone(),
            raw: Value::Object(obj),
        },
    };
    Ok(InboundMessage::Event(event))
}

fn typed<T: DeserializeOwned>(obj: Map<String, Value>, kind: &str) -> Result<T> {
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| Error::Protocol(format!("malformed {kind}: {e}")))
}

fn parse_response(mut obj: Map<String, Value>) -> Result<Response> {
    let status = match obj.get("status") {
        Some(Value::String(s)) => ResponseStatus::from_token(s),
        Some(other) => {
            return Err(Error::Protocol(format!(
                "malformed response: status is not a string: {other}"
            )));
        }
        None => return Err(Error::Protocol("malformed response: missing status".into())),
    };

    let response_to = obj
        .get("response_to")
        .or_else(|| obj.get("id"))
        .and_then(id_from_value);

    Ok(Response {
        response_to,
        status,
        value: obj.remove("value"),
    })
}

fn id_from_value(v: &Value) -> Option<RequestId> {
    match v {
        Value::String(s) => Some(RequestId::new(s.as_str())),
        Value::Number(n) => Some(RequestId::new(n.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(id: &str, cmd: &Command) -> Value {
        let line = encode_request(&RequestId::from(id), cmd).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        serde_json::from_slice(&line).unwrap()
    }

    // -- Encoding -----------------------------------------------------------

    #[test]
    fn encode_digital_write() {
        let v = encoded(
            "r1",
            &Command::DigitalWrite {
                pin: PinName::Digital(13),
                value: 1,
            },
        );
        assert_eq!(
            v,
            json!({"id": "r1", "command": "digital_write", "pin": "D13", "value": 1})
        );
    }

    #[test]
    fn encode_pin_mode_uses_wire_tokens() {
        let v = encoded(
            "r2",
            &Command::PinMode {
                pin: PinName::Digital(2),
                mode: PinMode::InputPullup,
            },
        );
        assert_eq!(
            v,
            json!({"id": "r2", "command": "pin_mode", "pin": "D2", "mode": "INPUT_PULLUP"})
        );
    }

    #[test]
    fn encode_servo_write_uses_angle() {
        let v = encoded(
            "r3",
            &Command::ServoWrite {
                pin: PinName::Digital(9),
                angle: 90,
            },
        );
        assert_eq!(v["angle"], 90);
        assert_eq!(v["command"], "servo_write");
    }

    #[test]
    fn encode_configure_sensor_pin() {
        let v = encoded(
            "r4",
            &Command::ConfigureSensorPin {
                sensor_type: SensorId::new("ULTRASONIC"),
                pin_config: json!({"trig": "D7", "echo": "D8"}),
            },
        );
        assert_eq!(v["sensor_type"], "ULTRASONIC");
        assert_eq!(v["pin_config"]["echo"], "D8");
    }

    #[test]
    fn encode_configure_sensors_batch() {
        let v = encoded(
            "r5",
            &Command::ConfigureSensors {
                sensors: vec![SensorConfig {
                    sensor_type: SensorId::new("B24_TEMP_HUMIDITY"),
                    pin_config: json!({"data": "D4"}),
                }],
            },
        );
        assert_eq!(v["sensors"][0]["sensor_type"], "DHT11");
    }

    #[test]
    fn encode_unit_commands() {
        assert_eq!(
            encoded("r6", &Command::GetPinStates),
            json!({"id": "r6", "command": "get_pin_states"})
        );
        assert_eq!(
            encoded("r7", &Command::Reset),
            json!({"id": "r7", "command": "reset"})
        );
        assert_eq!(encoded("r8", &Command::WriteB37 { value: 1 })["command"], "write_b37");
    }

    #[test]
    fn encoded_name_matches_name() {
        let cmds = [
            Command::AnalogRead {
                pin: PinName::Analog(0),
            },
            Command::ServoDetach {
                pin: PinName::Digital(9),
            },
            Command::ReadSensor {
                sensor: SensorId::new("DHT11"),
            },
            Command::GetPinStates,
        ];
        for cmd in &cmds {
            assert_eq!(encoded("r1", cmd)["command"], cmd.name());
        }
    }

    #[test]
    fn decode_request_round_trip() {
        let cmd = Command::AnalogWrite {
            pin: PinName::Digital(5),
            value: 200,
        };
        let line = encode_request(&RequestId::from("r9"), &cmd).unwrap();
        let (id, decoded) = decode_request(std::str::from_utf8(&line).unwrap()).unwrap();
        assert_eq!(id.as_str(), "r9");
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn decode_request_unknown_command() {
        let err = decode_request(r#"{"id":"r1","command":"self_destruct"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    // -- Classes and validation ---------------------------------------------

    #[test]
    fn command_classes() {
        let pin = PinName::Digital(3);
        assert_eq!(Command::DigitalRead { pin }.class(), CommandClass::Pin);
        assert_eq!(
            Command::ReadSensor {
                sensor: SensorId::new("DHT11")
            }
            .class(),
            CommandClass::Sensor
        );
        assert_eq!(
            Command::ConfigureSensors { sensors: vec![] }.class(),
            CommandClass::Config
        );
        assert_eq!(Command::Reset.class(), CommandClass::System);
    }

    #[test]
    fn validate_ranges() {
        let pin = PinName::Digital(9);
        assert!(Command::ServoWrite { pin, angle: 180 }.validate().is_ok());
        assert!(matches!(
            Command::ServoWrite { pin, angle: 181 }.validate(),
            Err(Error::InvalidParameter(_))
        ));
        assert!(Command::DigitalWrite { pin, value: 2 }.validate().is_err());
        assert!(
            Command::ConfigureSensorPin {
                sensor_type: SensorId::new("DHT11"),
                pin_config: json!("D4"),
            }
            .validate()
            .is_err()
        );
    }

    // -- Responses ----------------------------------------------------------

    #[test]
    fn parse_ok_response() {
        let msg =
            parse_message(r#"{"type":"response","status":"ok","response_to":"r1","value":512}"#)
                .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response(Response {
                response_to: Some(RequestId::from("r1")),
                status: ResponseStatus::Ok,
                value: Some(json!(512)),
            })
        );
    }

    #[test]
    fn parse_error_response() {
        let msg =
            parse_message(r#"{"type":"response","status":"invalid_pin","response_to":"r4"}"#)
                .unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.status, ResponseStatus::InvalidPin);
        assert!(resp.value.is_none());
    }

    #[test]
    fn parse_response_legacy_id() {
        let msg = parse_message(r#"{"type":"response","status":"ok","id":"r3"}"#).unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.response_to, Some(RequestId::from("r3")));
    }

    #[test]
    fn parse_response_without_id() {
        let msg = parse_message(r#"{"type":"response","status":"ok"}"#).unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert!(resp.response_to.is_none());
    }

    #[test]
    fn parse_response_missing_status() {
        let err = parse_message(r#"{"type":"response","response_to":"r1"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn response_to_json() {
        let resp = Response {
            response_to: Some(RequestId::from("r2")),
            status: ResponseStatus::Ok,
            value: Some(json!(1)),
        };
        assert_eq!(
            resp.to_json(),
            json!({"type": "response", "status": "ok", "response_to": "r2", "value": 1})
        );
    }

    // -- Events -------------------------------------------------------------

    #[test]
    fn parse_pin_update() {
        let msg = parse_message(r#"{"type":"pin_update","pin_name":"D13","value":1}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Event(BoardEvent::PinUpdate(PinUpdate {
                pin_name: "D13".into(),
                value: 1,
            }))
        );
    }

    #[test]
    fn parse_sensor_data_alias() {
        let msg =
            parse_message(r#"{"type":"sensor_data","sensor":"B24_TEMP","value":21.5,"unit":"C"}"#)
                .unwrap();
        let InboundMessage::Event(BoardEvent::SensorUpdate(r)) = msg else {
            panic!("expected sensor update");
        };
        assert_eq!(r.sensor, "B24_TEMP");
        assert_eq!(r.value, Some(21.5));
        assert_eq!(r.unit.as_deref(), Some("C"));
    }

    #[test]
    fn parse_status_and_error_notices() {
        assert_eq!(
            parse_message(r#"{"type":"status","message":"ready"}"#).unwrap(),
            InboundMessage::Event(BoardEvent::Status {
                message: "ready".into()
            })
        );
        assert_eq!(
            parse_message(r#"{"type":"error","message":"overheat"}"#).unwrap(),
            InboundMessage::Event(BoardEvent::DeviceError {
                message: "overheat".into()
            })
        );
    }

    #[test]
    fn parse_config_keeps_raw_json() {
        let msg = parse_message(r#"{"type":"config","board":"UNO","version":"4.0"}"#).unwrap();
        let InboundMessage::Event(BoardEvent::Config(raw)) = msg else {
            panic!("expected config");
        };
        assert_eq!(raw["board"], "UNO");
    }

    #[test]
    fn parse_unknown_type() {
        let msg = parse_message(r#"{"type":"heartbeat","uptime":5}"#).unwrap();
        let InboundMessage::Event(BoardEvent::Unknown { kind, raw }) = msg else {
            panic!("expected unknown");
        };
        assert_eq!(kind.as_deref(), Some("heartbeat"));
        assert_eq!(raw["uptime"], 5);
    }

    #[test]
    fn parse_object_without_type() {
        let msg = parse_message(r#"{"hello":"world"}"#).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::Event(BoardEvent::Unknown { kind: None, .. })
        ));
    }

    // -- Malformed lines ----------------------------------------------------

    #[test]
    fn parse_truncated_json() {
        let err = parse_message(r#"{"id":"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn parse_non_object() {
        assert!(parse_message("[1,2,3]").is_err());
        assert!(parse_message("42").is_err());
    }

    #[test]
    fn parse_malformed_known_type() {
        let err = parse_message(r#"{"type":"pin_update","pin_name":13}"#).unwrap_err();
        assert!(err.to_string().contains("malformed pin_update"));
    }

    #[test]
    fn parse_trims_crlf() {
        let msg = parse_message("{\"type\":\"status\",\"message\":\"ok\"}\r").unwrap();
        assert!(matches!(msg, InboundMessage::Event(BoardEvent::Status { .. })));
    }
}
