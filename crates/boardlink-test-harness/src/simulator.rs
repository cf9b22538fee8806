//! A virtual Arduino Uno speaking the boardlink protocol.
//!
//! [`Simulator::spawn`] starts a task that owns the device end of an
//! in-memory pipe and answers every recognized command the way the v4.0
//! sketch does: a `response` echoing the request id, followed by
//! `pin_update` broadcasts for pin writes and reads. It also greets with a
//! `status` line on start and pushes periodic climate readings.
//!
//! Pins: `D0`..`D13` and `A0`..`A5`. Sensors: `DHT11` (temperature and
//! humidity), `B24_TEMP`, `B24_HUMIDITY`, `ULTRASONIC` and `VIBRATION`.
//! Latency, a random error rate, and analog noise are configurable; a fixed
//! seed makes runs reproducible.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use boardlink_core::transport::Transport;
use boardlink_core::types::{PinMode, PinName, RequestId};
use boardlink_protocol::codec::{Command, decode_request};
use boardlink_protocol::framing::{Frame, LineBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DIGITAL_PINS: u8 = 14;
const ANALOG_PINS: u8 = 6;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Simulator behaviour knobs.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Delay before each response.
    pub latency: Duration,
    /// Probability (0.0..=1.0) that a command fails with `simulated_error`.
    pub error_rate: f64,
    /// Relative noise on analog reads (0.05 = +/-5%).
    pub noise_amplitude: f64,
    /// Interval of unsolicited `B24_TEMP` / `B24_HUMIDITY` pushes.
    /// `None` disables them.
    pub sensor_interval: Option<Duration>,
    /// Send a `status` greeting when the simulator starts.
    pub greeting: bool,
    /// Seed for reproducible readings. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            error_rate: 0.0,
            noise_amplitude: 0.05,
            sensor_interval: Some(Duration::from_secs(1)),
            greeting: true,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// A quiet, deterministic configuration for tests: no latency, no
    /// greeting, no periodic pushes, no errors, no noise.
    pub fn quiet() -> Self {
        Self {
            latency: Duration::ZERO,
            error_rate: 0.0,
            noise_amplitude: 0.0,
            sensor_interval: None,
            greeting: false,
            seed: Some(0),
        }
    }
}

/// The host end of a simulator pipe, usable as a client [`Transport`].
pub struct SimulatorLink {
    stream: DuplexStream,
}

impl Transport for SimulatorLink {
    fn name(&self) -> &str {
        "simulator"
    }
}

impl AsyncRead for SimulatorLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SimulatorLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Handle to a running simulator task.
pub struct Simulator {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Simulator {
    /// Start a simulator; returns the host-side transport and the handle.
    pub fn spawn(config: SimulatorConfig) -> (SimulatorLink, Simulator) {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(device, config, cancel.clone()));
        (
            SimulatorLink { stream: host },
            Simulator {
                cancel,
                task: Some(task),
            },
        )
    }

    /// Unplug the virtual board. The client sees end-of-stream.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the simulator task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(mut device: DuplexStream, config: SimulatorConfig, cancel: CancellationToken) {
    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut board = BoardState::new(config.clone(), rng);
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 1024];

    if config.greeting && write_messages(&mut device, &[board.greeting()]).await.is_err() {
        return;
    }

    // A disabled push interval still needs a timer for select!; park it far out.
    let period = config
        .sensor_interval
        .unwrap_or(Duration::from_secs(24 * 60 * 60));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("simulator stopped");
                break;
            }
            _ = ticker.tick(), if config.sensor_interval.is_some() => {
                let pushes = board.periodic_readings();
                if write_messages(&mut device, &pushes).await.is_err() {
                    break;
                }
            }
            read = device.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        debug!("simulator host closed");
                        break;
                    }
                    Ok(n) => n,
                };
                for frame in lines.push(&buf[..n]) {
                    let Frame::Line(line) = frame else {
                        continue;
                    };
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    trace!(line = %line, "simulator received");
                    if !config.latency.is_zero() {
                        tokio::time::sleep(config.latency).await;
                    }
                    let out = board.handle_line(line);
                    if write_messages(&mut device, &out).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn write_messages(device: &mut DuplexStream, msgs: &[Value]) -> io::Result<()> {
    for msg in msgs {
        let mut line = msg.to_string().into_bytes();
        line.push(b'\n');
        device.write_all(&line).await?;
    }
    device.flush().await
}

// ---------------------------------------------------------------------------
// Board model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DigitalPin {
    mode: PinMode,
    value: i64,
}

#[derive(Debug, Clone, Copy)]
struct Drifting {
    value: f64,
    min: f64,
    max: f64,
    noise: f64,
    drift: f64,
}

impl Drifting {
    fn sample(&mut self, rng: &mut StdRng) -> f64 {
        self.value = (self.value + jitter(rng, self.drift)).clamp(self.min, self.max);
        let v = (self.value + jitter(rng, self.noise)).clamp(self.min, self.max);
        (v * 100.0).round() / 100.0
    }
}

fn jitter(rng: &mut StdRng, amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rng.gen_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}

/// The simulated board's state and command semantics, independent of I/O.
struct BoardState {
    config: SimulatorConfig,
    rng: StdRng,
    digital: Vec<DigitalPin>,
    analog: Vec<i64>,
    servos: BTreeMap<u8, u8>,
    sensors: BTreeMap<String, Value>,
    b37: u8,
    temperature: Drifting,
    humidity: Drifting,
    distance: Drifting,
}

impl BoardState {
    fn new(config: SimulatorConfig, rng: StdRng) -> Self {
        BoardState {
            config,
            rng,
            digital: vec![
                DigitalPin {
                    mode: PinMode::Input,
                    value: 0,
                };
                DIGITAL_PINS as usize
            ],
            analog: vec![0; ANALOG_PINS as usize],
            servos: BTreeMap::new(),
            sensors: BTreeMap::new(),
            b37: 0,
            temperature: Drifting {
                value: 23.5,
                min: 18.0,
                max: 32.0,
                noise: 0.2,
                drift: 0.01,
            },
            humidity: Drifting {
                value: 45.0,
                min: 30.0,
                max: 70.0,
                noise: 1.0,
                drift: 0.02,
            },
            distance: Drifting {
                value: 150.0,
                min: 2.0,
                max: 400.0,
                noise: 2.0,
                drift: 0.0,
            },
        }
    }

    fn reset(&mut self) {
        let config = self.config.clone();
        let rng = self.rng.clone();
        *self = BoardState::new(config, rng);
    }

    fn greeting(&self) -> Value {
        json!({
            "type": "status",
            "message": "boardlink simulator ready",
            "board": "UNO",
            "version": "4.0",
        })
    }

    fn periodic_readings(&mut self) -> Vec<Value> {
        let t = self.temperature.sample(&mut self.rng);
        let h = self.humidity.sample(&mut self.rng);
        vec![
            json!({"type": "sensor_update", "sensor": "B24_TEMP", "value": t, "unit": "C"}),
            json!({"type": "sensor_update", "sensor": "B24_HUMIDITY", "value": h, "unit": "%"}),
        ]
    }

    /// Process one request line; returns the lines to send back in order.
    fn handle_line(&mut self, line: &str) -> Vec<Value> {
        let (id, command) = match decode_request(line) {
            Ok(req) => req,
            Err(_) => {
                // Salvage the id so the host can correlate the rejection.
                return match serde_json::from_str::<Value>(line) {
                    Ok(v) => {
                        let id = v.get("id").and_then(Value::as_str).unwrap_or_default();
                        vec![response(id, "unknown_command", None)]
                    }
                    Err(_) => vec![json!({"type": "error", "message": "invalid JSON"})],
                };
            }
        };

        if self.config.error_rate > 0.0 && self.rng.gen_bool(self.config.error_rate.min(1.0)) {
            return vec![response(id.as_str(), "simulated_error", None)];
        }

        self.execute(&id, command)
    }

    fn execute(&mut self, id: &RequestId, command: Command) -> Vec<Value> {
        let id = id.as_str();
        match command {
            Command::PinMode { pin, mode } => match pin {
                PinName::Digital(n) if n < DIGITAL_PINS => {
                    self.digital[n as usize].mode = mode;
                    vec![response(id, "ok", None)]
                }
                PinName::Analog(n) if n < ANALOG_PINS => vec![response(id, "ok", None)],
                _ => vec![response(id, "invalid_pin", None)],
            },

            Command::DigitalWrite { pin, value } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                if self.digital[n].mode != PinMode::Output {
                    return vec![response(id, "invalid_mode", None)];
                }
                self.digital[n].value = i64::from(value);
                vec![
                    response(id, "ok", Some(json!(value))),
                    pin_update(pin, i64::from(value)),
                ]
            }

            Command::DigitalRead { pin } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                let p = self.digital[n];
                let value = match p.mode {
                    PinMode::InputPullup => 1,
                    PinMode::Input if self.config.noise_amplitude > 0.0 => {
                        i64::from(self.rng.gen_bool(0.3))
                    }
                    _ => p.value,
                };
                self.digital[n].value = value;
                vec![response(id, "ok", Some(json!(value))), pin_update(pin, value)]
            }

            Command::AnalogRead { pin } => {
                let PinName::Analog(n) = pin else {
                    return vec![response(id, "invalid_pin", None)];
                };
                if n >= ANALOG_PINS {
                    return vec![response(id, "invalid_pin", None)];
                }
                let base = match self.analog[n as usize] {
                    0 if self.config.noise_amplitude > 0.0 => self.rng.gen_range(0..=1023),
                    v => v,
                };
                let noise = jitter(&mut self.rng, self.config.noise_amplitude);
                let value = ((base as f64 * (1.0 + noise)) as i64).clamp(0, 1023);
                self.analog[n as usize] = value;
                vec![response(id, "ok", Some(json!(value))), pin_update(pin, value)]
            }

            Command::AnalogWrite { pin, value } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                self.digital[n].value = i64::from(value);
                vec![
                    response(id, "ok", Some(json!(value))),
                    pin_update(pin, i64::from(value)),
                ]
            }

            Command::ServoAttach { pin } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                self.servos.insert(n as u8, 90);
                self.digital[n].mode = PinMode::Output;
                vec![response(id, "ok", None)]
            }

            Command::ServoWrite { pin, angle } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                match self.servos.get_mut(&(n as u8)) {
                    Some(a) => {
                        *a = angle;
                        vec![response(id, "ok", Some(json!(angle)))]
                    }
                    None => vec![response(id, "servo_not_attached", None)],
                }
            }

            Command::ServoDetach { pin } => {
                let Some(n) = self.digital_index(pin) else {
                    return vec![response(id, "invalid_pin", None)];
                };
                self.servos.remove(&(n as u8));
                vec![response(id, "ok", None)]
            }

            Command::ReadSensor { sensor } => self.read_sensor(id, sensor.as_str()),

            Command::ConfigureSensorPin {
                sensor_type,
                pin_config,
            } => {
                self.sensors.insert(sensor_type.to_string(), pin_config);
                vec![response(id, "ok", None)]
            }

            Command::ConfigureSensors { sensors } => {
                let count = sensors.len();
                for s in sensors {
                    self.sensors.insert(s.sensor_type.to_string(), s.pin_config);
                }
                vec![response(id, "ok", Some(json!(count)))]
            }

            Command::GetPinStates => {
                let states = self.pin_states();
                let mut event = states.clone();
                event["type"] = json!("pin_states");
                vec![response(id, "ok", Some(states)), event]
            }

            Command::WriteB37 { value } => {
                self.b37 = value;
                vec![response(id, "ok", Some(json!(value)))]
            }

            Command::Reset => {
                self.reset();
                vec![
                    response(id, "ok", None),
                    json!({"type": "status", "message": "board reset"}),
                ]
            }
        }
    }

    fn digital_index(&self, pin: PinName) -> Option<usize> {
        match pin {
            PinName::Digital(n) if n < DIGITAL_PINS => Some(n as usize),
            _ => None,
        }
    }

    fn read_sensor(&mut self, id: &str, sensor: &str) -> Vec<Value> {
        let (value, event) = match sensor {
            "DHT11" => {
                let t = self.temperature.sample(&mut self.rng);
                let h = self.humidity.sample(&mut self.rng);
                (
                    json!({"temperature": t, "humidity": h}),
                    json!({"type": "sensor_update", "sensor": "B24_TEMP", "value": t, "unit": "C"}),
                )
            }
            "B24_TEMP" => {
                let t = self.temperature.sample(&mut self.rng);
                (
                    json!(t),
                    json!({"type": "sensor_update", "sensor": "B24_TEMP", "value": t, "unit": "C"}),
                )
            }
            "B24_HUMIDITY" => {
                let h = self.humidity.sample(&mut self.rng);
                (
                    json!(h),
                    json!({"type": "sensor_update", "sensor": "B24_HUMIDITY", "value": h, "unit": "%"}),
                )
            }
            "ULTRASONIC" => {
                let d = self.distance.sample(&mut self.rng);
                (
                    json!(d),
                    json!({"type": "sensor_update", "sensor": "ULTRASONIC", "value": d, "unit": "cm"}),
                )
            }
            "VIBRATION" => {
                let intensity: i64 = if self.rng.gen_bool(0.05) {
                    self.rng.gen_range(800..=1023)
                } else {
                    self.rng.gen_range(0..=50)
                };
                let vibrating = intensity > 500;
                (
                    json!({"intensity": intensity, "vibrating": vibrating}),
                    json!({
                        "type": "sensor_update",
                        "sensor": "VIBRATION",
                        "intensity": intensity,
                        "vibrating": vibrating,
                    }),
                )
            }
            // The sketch answers `ok` without a value for sensors it does
            // not know.
            _ => return vec![response(id, "ok", None)],
        };
        vec![response(id, "ok", Some(value)), event]
    }

    fn pin_states(&self) -> Value {
        let digital: Vec<Value> = self
            .digital
            .iter()
            .enumerate()
            .map(|(i, p)| json!({"pin": format!("D{i}"), "mode": p.mode.as_str(), "value": p.value}))
            .collect();
        let analog: Vec<Value> = self
            .analog
            .iter()
            .enumerate()
            .map(|(i, v)| json!({"pin": format!("A{i}"), "value": v}))
            .collect();
        json!({"digital": digital, "analog": analog})
    }

    #[cfg(test)]
    fn servo_angle(&self, pin: u8) -> Option<u8> {
        self.servos.get(&pin).copied()
    }

    #[cfg(test)]
    fn configured_sensors(&self) -> std::collections::BTreeSet<String> {
        self.sensors.keys().cloned().collect()
    }
}

fn response(id: &str, status: &str, value: Option<Value>) -> Value {
    let mut msg = json!({"type": "response", "status": status, "response_to": id});
    if let Some(value) = value {
        msg["value"] = value;
    }
    msg
}

fn pin_update(pin: PinName, value: i64) -> Value {
    json!({"type": "pin_update", "pin_name": pin.to_string(), "value": value})
}
