// boardlink command-line tool -- drives a board (or the built-in simulator)
// from the shell.
//
// Usage:
//   boardlink ports
//   boardlink --port /dev/ttyACM0 pin mode D13 output
//   boardlink --port /dev/ttyACM0 pin write D13 high
//   boardlink --simulate analog read A0
//   boardlink --simulate sensor read DHT11
//   boardlink --port COM3 servo write D9 90
//   boardlink --simulate monitor --duration 10
//   boardlink --port /dev/ttyACM0 sequence blink.json
//   boardlink --simulate io-test --phases all


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use boardlink::sim::{Simulator, SimulatorConfig};
use boardlink::{
    BoardBuilder, BoardClient, BoardEvent, EventTag, Level, PinMode, PinName, Progress,
    Sequence, SequenceOutcome, SequenceRunner, TimeoutPolicy,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// boardlink -- talk to an Arduino running the JSON command sketch.
#[derive(Parser, Debug)]
#[command(name = "boardlink", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyACM0, COM3). When omitted, a single
    /// detected Arduino-like port is used.
    #[arg(long, global = true)]
    port: Option<String>,

    /// Baud rate.
    #[arg(long, global = true, default_value_t = boardlink::transport::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Use the in-process simulator instead of a serial port.
    #[arg(long, global = true)]
    simulate: bool,

    /// Response timeout in milliseconds for every command class.
    /// Defaults to the per-class timeouts.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports.
    Ports {
        /// Show every port, not only Arduino-like ones.
        #[arg(long)]
        all: bool,
    },

    /// Digital pin operations.
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },

    /// Analog pin operations.
    Analog {
        #[command(subcommand)]
        action: AnalogAction,
    },

    /// Servo operations.
    Servo {
        #[command(subcommand)]
        action: ServoAction,
    },

    /// Sensor operations.
    Sensor {
        #[command(subcommand)]
        action: SensorAction,
    },

    /// Print the board's pin table.
    States,

    /// Drive the B37 output module.
    B37 {
        value: u8,
    },

    /// Reset the sketch's pin and sensor state.
    Reset,

    /// Print unsolicited board messages as they arrive.
    Monitor {
        /// Duration in seconds (0 = until the board disconnects).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Run a JSON pin sequence file.
    Sequence {
        file: String,
    },

    /// Exercise the link: latency, concurrent correlation, events, shutdown.
    IoTest {
        /// Comma-separated phases, or `all`.
        #[arg(long, default_value = "all")]
        phases: String,

        /// Seconds for timed phases.
        #[arg(long, default_value_t = 3)]
        phase_duration: u64,

        /// Requests in flight at once during the concurrency phase.
        #[arg(long, default_value_t = 8)]
        concurrency: usize,

        /// Iterations for the concurrency and events phases.
        #[arg(long, default_value_t = 50)]
        iterations: u32,

        /// Output pin toggled by the events phase.
        #[arg(long, default_value = "D13")]
        pin: PinName,
    },
}

#[derive(Subcommand, Debug)]
enum PinAction {
    /// Set a pin's mode (input, output, input_pullup).
    Mode { pin: PinName, mode: PinMode },
    /// Drive a digital output (high/low/1/0).
    Write {
        pin: PinName,
        #[arg(value_parser = parse_level)]
        level: Level,
    },
    /// Read a digital pin.
    Read { pin: PinName },
}

#[derive(Subcommand, Debug)]
enum AnalogAction {
    /// Read an analog input (0-1023).
    Read { pin: PinName },
    /// Write a PWM duty cycle (0-255).
    Write { pin: PinName, value: u8 },
}

#[derive(Subcommand, Debug)]
enum ServoAction {
    Attach { pin: PinName },
    /// Move to an angle in degrees (0-180).
    Write { pin: PinName, angle: u8 },
    Detach { pin: PinName },
}

#[derive(Subcommand, Debug)]
enum SensorAction {
    /// Read a sensor (DHT11, B24_TEMP, B24_HUMIDITY, ULTRASONIC, VIBRATION).
    Read { sensor: String },
    /// Assign pins to a sensor, e.g. '{"trig":"D7","echo":"D8"}'.
    Configure { sensor: String, pins: String },
}

/// Parse a digital level: high/low, on/off, 1/0.
fn parse_level(s: &str) -> std::result::Result<Level, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "high" | "on" | "1" => Ok(Level::High),
        "low" | "off" | "0" => Ok(Level::Low),
        other => Err(format!("invalid level '{other}' (expected high or low)")),
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "boardlink=debug,boardlink_client=debug,boardlink_transport=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An open client plus the simulator behind it, if any.
struct Session {
    client: Arc<BoardClient>,
    simulator: Option<Simulator>,
}

impl Session {
    async fn close(self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!(error = %e, "disconnect failed");
        }
        if let Some(sim) = self.simulator {
            sim.join().await;
        }
    }
}

fn resolve_port(cli: &Cli) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    let boards = boardlink::detect_boards().context("failed to enumerate serial ports")?;
    match boards.as_slice() {
        [only] => {
            println!("Using detected board on {}", only.name);
            Ok(only.name.clone())
        }
        [] => bail!("no board detected; pass --port or --simulate"),
        many => bail!(
            "several boards detected ({}); pass --port",
            many.iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

async fn connect(cli: &Cli) -> Result<Session> {
    let mut builder = BoardBuilder::new().baud_rate(cli.baud);
    if let Some(ms) = cli.timeout {
        builder = builder.timeouts(TimeoutPolicy::uniform(Duration::from_millis(ms)));
    }

    if cli.simulate {
        if cli.port.is_some() {
            bail!("--port and --simulate are mutually exclusive");
        }
        let (link, simulator) = Simulator::spawn(SimulatorConfig::default());
        let client = builder
            .build_with_transport(link)
            .context("failed to start simulator client")?;
        println!("Connected to simulator");
        return Ok(Session {
            client: Arc::new(client),
            simulator: Some(simulator),
        });
    }

    let port = resolve_port(cli)?;
    tracing::debug!(%port, baud = cli.baud, timeout_ms = ?cli.timeout, "opening board");
    let client = builder
        .serial_port(&port)
        .build()
        .await
        .with_context(|| format!("failed to open {port} at {} baud", cli.baud))?;
    println!("Connected to {port} at {} baud", cli.baud);
    Ok(Session {
        client: Arc::new(client),
        simulator: None,
    })
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn format_value(value: &Option<Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "(no value)".into(),
    }
}

fn format_event(event: &BoardEvent) -> String {
    match event {
        BoardEvent::PinUpdate(u) => format!("pin {} = {}", u.pin_name, u.value),
        BoardEvent::SensorUpdate(r) => {
            let mut s = format!("sensor {}", r.sensor);
            if let Some(v) = r.value {
                s.push_str(&format!(" = {v}"));
                if let Some(unit) = &r.unit {
                    s.push_str(&format!(" {unit}"));
                }
            }
            if let Some(i) = r.intensity {
                s.push_str(&format!(" intensity={i}"));
            }
            if let Some(v) = r.vibrating {
                s.push_str(&format!(" vibrating={v}"));
            }
            s
        }
        BoardEvent::PinStates(states) => format!(
            "pin states: {} digital, {} analog",
            states.digital.len(),
            states.analog.len()
        ),
        BoardEvent::Config(v) => format!("config {v}"),
        BoardEvent::Status { message } => format!("status: {message}"),
        BoardEvent::DeviceError { message } => format!("device error: {message}"),
        BoardEvent::Unknown { kind, raw } => {
            format!("unknown ({}): {raw}", kind.as_deref().unwrap_or("no type"))
        }
        BoardEvent::ParseError { line, reason } => format!("unparseable line {line:?}: {reason}"),
        BoardEvent::Connected => "connected".into(),
        BoardEvent::Disconnected => "disconnected".into(),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_ports(all: bool) -> Result<()> {
    let ports = if all {
        boardlink::transport::available_ports()?
    } else {
        boardlink::detect_boards()?
    };
    if ports.is_empty() {
        println!("No ports found.");
        return Ok(());
    }
    for p in &ports {
        let usb = match p.usb_id {
            Some((vid, pid)) => format!("{vid:04x}:{pid:04x}"),
            None => "-".into(),
        };
        println!(
            "{:<20}  {:<9}  {}",
            p.name,
            usb,
            p.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_pin(client: &BoardClient, action: &PinAction) -> Result<()> {
    match *action {
        PinAction::Mode { pin, mode } => {
            client.pin_mode(pin, mode).await?;
            println!("{pin} mode {mode}");
        }
        PinAction::Write { pin, level } => {
            client.digital_write(pin, level.is_high()).await?;
            println!("{pin} = {level}");
        }
        PinAction::Read { pin } => {
            let high = client.digital_read(pin).await?;
            println!("{pin} = {}", if high { Level::High } else { Level::Low });
        }
    }
    Ok(())
}

async fn cmd_analog(client: &BoardClient, action: &AnalogAction) -> Result<()> {
    match *action {
        AnalogAction::Read { pin } => {
            let v = client.analog_read(pin).await?;
            println!("{pin} = {v}");
        }
        AnalogAction::Write { pin, value } => {
            client.analog_write(pin, value).await?;
            println!("{pin} PWM = {value}");
        }
    }
    Ok(())
}

async fn cmd_servo(client: &BoardClient, action: &ServoAction) -> Result<()> {
    match *action {
        ServoAction::Attach { pin } => {
            client.servo_attach(pin).await?;
            println!("servo attached on {pin}");
        }
        ServoAction::Write { pin, angle } => {
            client.servo_write(pin, angle).await?;
            println!("servo {pin} -> {angle} deg");
        }
        ServoAction::Detach { pin } => {
            client.servo_detach(pin).await?;
            println!("servo detached from {pin}");
        }
    }
    Ok(())
}

async fn cmd_sensor(client: &BoardClient, action: &SensorAction) -> Result<()> {
    match action {
        SensorAction::Read { sensor } => {
            let value = client.read_sensor(sensor.as_str()).await?;
            println!("{sensor} = {}", format_value(&value));
        }
        SensorAction::Configure { sensor, pins } => {
            let pin_config: Value =
                serde_json::from_str(pins).context("pin configuration is not valid JSON")?;
            client.configure_sensor_pin(sensor.as_str(), pin_config).await?;
            println!("{sensor} configured");
        }
    }
    Ok(())
}

async fn cmd_states(client: &BoardClient) -> Result<()> {
    // Firmware that only broadcasts the table answers with an empty `ok`.
    let mut events = client.subscribe(&[EventTag::PinStates]);
    let states = match client.get_pin_states().await? {
        Some(states) => states,
        None => match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(BoardEvent::PinStates(states))) => states,
            _ => bail!("board acknowledged but sent no pin table"),
        },
    };

    println!("{:<5}  {:<13}  Value", "Pin", "Mode");
    println!("{:<5}  {:<13}  -----", "-----", "-------------");
    for p in states.digital.iter().chain(states.analog.iter()) {
        println!(
            "{:<5}  {:<13}  {}",
            p.pin,
            p.mode.as_deref().unwrap_or("-"),
            p.value
        );
    }
    Ok(())
}

async fn cmd_monitor(client: &BoardClient, duration_secs: u64) -> Result<()> {
    let mut events = client.subscribe(&EventTag::ALL);
    println!("Monitoring board messages...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));

    loop {
        let next = match deadline {
            Some(dl) => match tokio::time::timeout_at(dl, events.recv()).await {
                Ok(ev) => ev,
                Err(_) => {
                    println!("Monitor duration elapsed.");
                    break;
                }
            },
            None => events.recv().await,
        };
        match next {
            Some(BoardEvent::Disconnected) | None => {
                println!("Board disconnected.");
                break;
            }
            Some(event) => println!("[event] {}", format_event(&event)),
        }
    }

    let stats = client.stats();
    println!(
        "{} events, {} parse errors, {} orphaned responses",
        stats.events, stats.parse_errors, stats.orphaned_responses
    );
    if let Some(rtt) = stats.response_times {
        println!("round trip: {rtt}");
    }
    Ok(())
}

async fn cmd_sequence(client: Arc<BoardClient>, file: &str) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {file}"))?;
    let seq = Sequence::from_json(&text).with_context(|| format!("invalid sequence file {file}"))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = SequenceRunner::new(client, CancellationToken::new()).with_progress(tx);

    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            match progress {
                Progress::CycleStarted { cycle } => println!("cycle {cycle}"),
                Progress::Step(entry) => println!(
                    "  {:>8.3}s  {:<12}  {:<4}  {}",
                    entry.elapsed.as_secs_f64(),
                    entry.action,
                    entry.pin.map(|p| p.to_string()).unwrap_or_default(),
                    entry.detail
                ),
                Progress::CycleFinished { cycle, duration } => {
                    println!("cycle {cycle} done in {:.3}s", duration.as_secs_f64())
                }
            }
        }
    });

    let report = runner.run(&seq).await;
    drop(runner);
    let _ = printer.await;

    println!();
    println!(
        "Sequence '{}': {} cycle(s) completed",
        report.name, report.cycles_completed
    );
    match report.outcome {
        SequenceOutcome::Completed => Ok(()),
        SequenceOutcome::Stopped => bail!("sequence stopped"),
        SequenceOutcome::Timeout { pin } => bail!("timed out waiting for {pin}"),
        SequenceOutcome::Failed(reason) => bail!("sequence failed: {reason}"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // `ports` does not need a connection.
    if let Command::Ports { all } = cli.command {
        return cmd_ports(all);
    }

    let session = connect(&cli).await?;
    let client = Arc::clone(&session.client);

    let result = match &cli.command {
        Command::Pin { action } => cmd_pin(&client, action).await,
        Command::Analog { action } => cmd_analog(&client, action).await,
        Command::Servo { action } => cmd_servo(&client, action).await,
        Command::Sensor { action } => cmd_sensor(&client, action).await,
        Command::States => cmd_states(&client).await,
        Command::B37 { value } => client
            .write_b37(*value)
            .await
            .map(|()| println!("B37 = {value}"))
            .map_err(Into::into),
        Command::Reset => client
            .reset()
            .await
            .map(|()| println!("board reset"))
            .map_err(Into::into),
        Command::Monitor { duration } => cmd_monitor(&client, *duration).await,
        Command::Sequence { file } => cmd_sequence(Arc::clone(&client), file).await,
        Command::IoTest {
            phases,
            phase_duration,
            concurrency,
            iterations,
            pin,
        } => {
            let opts = io_test::IoTestOptions {
                phases: io_test::parse_phases(phases)?,
                phase_duration: *phase_duration,
                concurrency: *concurrency,
                iterations: *iterations,
                pin: *pin,
            };
            io_test::cmd_io_test(Arc::clone(&client), opts).await
        }
        Command::Ports { .. } => unreachable!("ports handled above"),
    };

    drop(client);
    session.close().await;
    result
}
