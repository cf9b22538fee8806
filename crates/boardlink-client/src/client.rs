//! Board client: command/response correlation over one serial link.
//!
//! [`BoardClient`] splits its transport in two. A background reader task
//! owns the read half: it frames lines, resolves pending requests by
//! `response_to`, and publishes everything else to the event bus. Callers
//! on any task queue request lines for a writer task that owns the write
//! half. Each queued line is written whole, even when the caller stops
//! waiting for it, so request lines never interleave or arrive truncated.
//!
//! Every issued request ends in exactly one of: the response value, a
//! device error, a timeout, a cancellation, or connection-lost. Dropping a
//! [`PendingRequest`] before it resolves abandons it; a late response is
//! then counted as orphaned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use boardlink_core::error::{Error, Result};
use boardlink_core::events::{BoardEvent, EventTag, PinStates};
use boardlink_core::transport::Transport;
use boardlink_core::types::{PinMode, PinName, RequestId, SensorId};
use boardlink_protocol::codec::{self, Command, CommandClass, InboundMessage, Response, SensorConfig};
use boardlink_protocol::framing::{Frame, LineBuffer, MAX_LINE};

use crate::fanout::{EventBus, Subscription, SubscriptionId};
use crate::pending::{Outcome, PendingTable};
use crate::stats::{LinkStats, StatsSnapshot};

/// A transport boxed for storage in the client.
pub type BoxedTransport = Box<dyn Transport>;

/// Size of each read from the transport.
const READ_CHUNK: usize = 1024;

/// Depth of the outbound request queue.
const WRITE_QUEUE: usize = 32;

/// A request line queued for the writer task.
struct WriteRequest {
    line: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

/// Default response timeouts per command class.
///
/// Pin operations are answered immediately by the sketch; sensor reads may
/// block it for a conversion (a DHT11 read takes ~250 ms, an ultrasonic
/// ping up to the echo timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub pin: Duration,
    pub sensor: Duration,
    pub config: Duration,
    pub system: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            pin: Duration::from_secs(1),
            sensor: Duration::from_secs(3),
            config: Duration::from_secs(2),
            system: Duration::from_secs(2),
        }
    }
}

impl TimeoutPolicy {
    /// The same timeout for every class.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            pin: timeout,
            sensor: timeout,
            config: timeout,
            system: timeout,
        }
    }

    pub fn for_class(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Pin => self.pin,
            CommandClass::Sensor => self.sensor,
            CommandClass::Config => self.config,
            CommandClass::System => self.system,
        }
    }
}

/// Options for a [`BoardClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-class defaults used by [`BoardClient::issue_default`] and the
    /// typed operations.
    pub timeouts: TimeoutPolicy,
    /// Longest accepted inbound line, in bytes.
    pub max_line: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            max_line: MAX_LINE,
        }
    }
}

/// A request that has been written and awaits its outcome.
///
/// Obtained from [`BoardClient::submit`]. Dropping it before
/// [`wait`](Self::wait) completes abandons the request.
#[derive(Debug)]
#[must_use = "dropping a PendingRequest abandons it"]
pub struct PendingRequest {
    id: RequestId,
    command: &'static str,
    rx: oneshot::Receiver<Outcome>,
    deadline: Instant,
    pending: Arc<PendingTable>,
    stats: Arc<LinkStats>,
    finished: bool,
}

impl PendingRequest {
    /// The id the request was sent with.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// The wire name of the command.
    pub fn command(&self) -> &'static str {
        self.command
    }

    /// When the request times out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the outcome.
    ///
    /// Returns the response `value` on `status: "ok"`, and
    /// [`Error::Device`], [`Error::Timeout`], [`Error::Cancelled`] or
    /// [`Error::ConnectionLost`] otherwise.
    pub async fn wait(mut self) -> Result<Option<Value>> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::ConnectionLost,
            Err(_) => {
                if self.pending.remove(&self.id) {
                    self.finished = true;
                    self.stats.record_timeout();
                    tracing::debug!(id = %self.id, command = self.command, "request timed out");
                    return Err(Error::Timeout);
                }
                // Someone else removed the entry first and completed it
                // under the table lock, so the outcome is already queued.
                self.rx.try_recv().unwrap_or(Outcome::ConnectionLost)
            }
        };
        self.finished = true;

        match outcome {
            Outcome::Reply(Response { status, value, .. }) => {
                if status.is_ok() {
                    Ok(value)
                } else {
                    tracing::debug!(id = %self.id, status = %status, "device rejected command");
                    Err(Error::Device { status })
                }
            }
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::ConnectionLost => Err(Error::ConnectionLost),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished && self.pending.remove(&self.id) {
            tracing::debug!(id = %self.id, command = self.command, "request abandoned");
        }
    }
}

/// State shared between the client handle and its reader task.
struct ReaderContext {
    name: String,
    pending: Arc<PendingTable>,
    events: Arc<EventBus>,
    stats: Arc<LinkStats>,
    connected: Arc<AtomicBool>,
}

/// Client for a board speaking line-delimited JSON.
///
/// Safe to share across tasks behind an `Arc`; every method takes `&self`.
pub struct BoardClient {
    name: String,
    write_tx: mpsc::Sender<WriteRequest>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingTable>,
    events: Arc<EventBus>,
    stats: Arc<LinkStats>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    options: ClientOptions,
}

impl BoardClient {
    /// Take ownership of an open transport and start the reader task.
    ///
    /// Must be called from within a tokio runtime. A
    /// [`BoardEvent::Connected`] is published before this returns, so only
    /// subscribers created later observe subsequent events.
    pub fn connect<T: Transport>(transport: T, options: ClientOptions) -> Self {
        let name = transport.name().to_string();
        let boxed: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);

        let pending = Arc::new(PendingTable::new());
        let events = Arc::new(EventBus::new());
        let stats = Arc::new(LinkStats::new());
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let ctx = ReaderContext {
            name: name.clone(),
            pending: Arc::clone(&pending),
            events: Arc::clone(&events),
            stats: Arc::clone(&stats),
            connected: Arc::clone(&connected),
        };
        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE);
        let writer_handle = tokio::spawn(write_loop(
            write_half,
            write_rx,
            name.clone(),
            shutdown.clone(),
        ));
        let reader_handle = tokio::spawn(read_loop(
            read_half,
            ctx,
            options.max_line,
            shutdown.clone(),
        ));

        events.publish(BoardEvent::Connected);
        tracing::info!(port = %name, "board client connected");

        BoardClient {
            name,
            write_tx,
            writer_handle: Mutex::new(Some(writer_handle)),
            pending,
            events,
            stats,
            connected,
            shutdown,
            reader_handle: Mutex::new(Some(reader_handle)),
            options,
        }
    }

    /// Name of the underlying link (port path, `simulator`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Whether the reader task is still running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding requests past their deadline whose waiters have not yet
    /// observed the timeout.
    pub fn overdue_requests(&self) -> Vec<(RequestId, &'static str)> {
        self.pending.overdue(Instant::now())
    }

    /// A snapshot of the link counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to events with any of the given tags.
    pub fn subscribe(&self, tags: &[EventTag]) -> Subscription {
        self.events.subscribe(Arc::downgrade(&self.events), tags)
    }

    /// Remove a subscription by id. Dropping the [`Subscription`] does the
    /// same.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Write a request and return a handle to await its outcome.
    ///
    /// The pending entry is registered before the line is written, so a
    /// response can never arrive for an unknown id. If the write fails the
    /// entry is removed and the transport error is returned.
    pub async fn submit(&self, command: Command, timeout: Duration) -> Result<PendingRequest> {
        command.validate()?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let deadline = Instant::now() + timeout;
        let name = command.name();
        let (id, rx) = self.pending.register(name, deadline)?;
        let mut request = PendingRequest {
            id,
            command: name,
            rx,
            deadline,
            pending: Arc::clone(&self.pending),
            stats: Arc::clone(&self.stats),
            finished: false,
        };

        let line = codec::encode_request(&request.id, &command)?;
        tracing::trace!(
            port = %self.name,
            id = %request.id,
            line = %String::from_utf8_lossy(&line).trim_end(),
            "sending request"
        );

        if let Err(e) = self.write_line(line, deadline).await {
            self.pending.remove(&request.id);
            request.finished = true;
            return Err(e);
        }

        self.stats.record_sent();
        Ok(request)
    }

    /// Issue a command and wait for its outcome.
    pub async fn issue(&self, command: Command, timeout: Duration) -> Result<Option<Value>> {
        self.submit(command, timeout).await?.wait().await
    }

    /// Issue a command with the default timeout for its class.
    pub async fn issue_default(&self, command: Command) -> Result<Option<Value>> {
        let timeout = self.options.timeouts.for_class(command.class());
        self.issue(command, timeout).await
    }

    /// Cancel a pending request. Its waiter resolves with
    /// [`Error::Cancelled`] immediately; a later response is orphaned.
    ///
    /// Returns `false` if the request already resolved.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let cancelled = self.pending.cancel(id);
        if cancelled {
            self.stats.record_cancelled();
            tracing::debug!(id = %id, "request cancelled");
        }
        cancelled
    }

    /// Close the link. Pending requests resolve with connection-lost and a
    /// [`BoardEvent::Disconnected`] is published. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();

        let writer = self.writer_handle.lock().await.take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        let reader = self.reader_handle.lock().await.take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Queue a line for the writer task and wait for it to reach the
    /// transport. Giving up at the deadline leaves the line queued; the
    /// writer either sends it whole or skips it if it has not started.
    async fn write_line(&self, line: Vec<u8>, deadline: Instant) -> Result<()> {
        let (reply, ack) = oneshot::channel();
        let queued = async {
            self.write_tx
                .send(WriteRequest { line, reply })
                .await
                .map_err(|_| Error::NotConnected)?;
            ack.await.map_err(|_| Error::ConnectionLost)?
        };
        match tokio::time::timeout_at(deadline, queued).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_timeout();
                tracing::debug!(port = %self.name, "request not written before its deadline");
                Err(Error::Timeout)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typed operations
    // -----------------------------------------------------------------------

    /// Set a pin's direction / pull-up.
    pub async fn pin_mode(&self, pin: PinName, mode: PinMode) -> Result<()> {
        self.issue_default(Command::PinMode { pin, mode }).await?;
        Ok(())
    }

    /// Drive a digital output high or low.
    pub async fn digital_write(&self, pin: PinName, high: bool) -> Result<()> {
        self.issue_default(Command::DigitalWrite {
            pin,
            value: u8::from(high),
        })
        .await?;
        Ok(())
    }

    /// Read a digital pin level.
    pub async fn digital_read(&self, pin: PinName) -> Result<bool> {
        let value = self.issue_default(Command::DigitalRead { pin }).await?;
        match value {
            Some(Value::Bool(b)) => Ok(b),
            other => Ok(int_value(other, "digital_read")? != 0),
        }
    }

    /// Read an analog input (0..=1023 on a 10-bit ADC).
    pub async fn analog_read(&self, pin: PinName) -> Result<u16> {
        let value = self.issue_default(Command::AnalogRead { pin }).await?;
        let raw = int_value(value, "analog_read")?;
        u16::try_from(raw)
            .map_err(|_| Error::Protocol(format!("analog_read value out of range: {raw}")))
    }

    /// Set a PWM duty cycle.
    pub async fn analog_write(&self, pin: PinName, value: u8) -> Result<()> {
        self.issue_default(Command::AnalogWrite { pin, value }).await?;
        Ok(())
    }

    pub async fn servo_attach(&self, pin: PinName) -> Result<()> {
        self.issue_default(Command::ServoAttach { pin }).await?;
        Ok(())
    }

    /// Move an attached servo to `angle` degrees (0..=180).
    pub async fn servo_write(&self, pin: PinName, angle: u8) -> Result<()> {
        self.issue_default(Command::ServoWrite { pin, angle }).await?;
        Ok(())
    }

    pub async fn servo_detach(&self, pin: PinName) -> Result<()> {
        self.issue_default(Command::ServoDetach { pin }).await?;
        Ok(())
    }

    /// Read a sensor. The value shape depends on the sensor; an `ok`
    /// without a value yields `None`.
    pub async fn read_sensor(&self, sensor: impl Into<SensorId>) -> Result<Option<Value>> {
        self.issue_default(Command::ReadSensor {
            sensor: sensor.into(),
        })
        .await
    }

    /// Assign pins to a sensor, e.g. `{"trig":"D7","echo":"D8"}`.
    pub async fn configure_sensor_pin(
        &self,
        sensor_type: impl Into<SensorId>,
        pin_config: Value,
    ) -> Result<()> {
        self.issue_default(Command::ConfigureSensorPin {
            sensor_type: sensor_type.into(),
            pin_config,
        })
        .await?;
        Ok(())
    }

    /// Configure several sensors in one request.
    pub async fn configure_sensors(&self, sensors: Vec<SensorConfig>) -> Result<()> {
        self.issue_default(Command::ConfigureSensors { sensors }).await?;
        Ok(())
    }

    /// Request the pin table. Some firmware answers with the table in the
    /// response; others only broadcast a `pin_states` event, in which case
    /// this returns `None`.
    pub async fn get_pin_states(&self) -> Result<Option<PinStates>> {
        match self.issue_default(Command::GetPinStates).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("malformed pin states: {e}"))),
            None => Ok(None),
        }
    }

    /// Drive the B37 output module.
    pub async fn write_b37(&self, value: u8) -> Result<()> {
        self.issue_default(Command::WriteB37 { value }).await?;
        Ok(())
    }

    /// Reset the sketch's pin and sensor state.
    pub async fn reset(&self) -> Result<()> {
        self.issue_default(Command::Reset).await?;
        Ok(())
    }
}

impl Drop for BoardClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn int_value(value: Option<Value>, command: &str) -> Result<i64> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| Error::Protocol(format!("{command}: value is not an integer: {n}"))),
        Some(other) => Err(Error::Protocol(format!(
            "{command}: expected a number, got {other}"
        ))),
        None => Err(Error::Protocol(format!("{command}: response has no value"))),
    }
}

// ---------------------------------------------------------------------------
// Writer loop
// ---------------------------------------------------------------------------

/// Background task that owns the write half and sends queued lines in
/// order. A failed write may leave part of a line on the wire, so it
/// cancels `shutdown`; the reader then fails every pending request.
async fn write_loop(
    mut writer: WriteHalf<BoxedTransport>,
    mut queue: mpsc::Receiver<WriteRequest>,
    name: String,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        if request.reply.is_closed() {
            tracing::debug!(port = %name, "caller gave up before its line was sent, skipping");
            continue;
        }

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = write_all_flushed(&mut writer, &request.line) => result,
        };
        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::error!(port = %name, error = %e, "write failed, closing link");
        }
        let _ = request.reply.send(result);
        if failed {
            shutdown.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
    tracing::debug!(port = %name, "writer stopped");
}

async fn write_all_flushed(writer: &mut WriteHalf<BoxedTransport>, line: &[u8]) -> Result<()> {
    writer
        .write_all(line)
        .await
        .map_err(|e| Error::Transport(format!("failed to send command: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Transport(format!("failed to flush command: {e}")))
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

/// Background task that reads lines from the transport and dispatches them.
async fn read_loop(
    mut reader: ReadHalf<BoxedTransport>,
    ctx: ReaderContext,
    max_line: usize,
    shutdown: CancellationToken,
) {
    let mut lines = LineBuffer::with_limit(max_line);
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "shutdown",
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "end of stream",
                Ok(n) => {
                    for frame in lines.push(&buf[..n]) {
                        dispatch_frame(frame, &ctx);
                    }
                }
                Err(e) => {
                    tracing::error!(port = %ctx.name, error = %e, "read error");
                    break "read error";
                }
            },
        }
    };

    shutdown.cancel();
    ctx.connected.store(false, Ordering::SeqCst);
    let failed = ctx.pending.fail_all();
    ctx.events.publish(BoardEvent::Disconnected);
    tracing::info!(port = %ctx.name, reason, failed, "board disconnected");
}

fn dispatch_frame(frame: Frame, ctx: &ReaderContext) {
    let bytes = match frame {
        Frame::Line(bytes) => bytes,
        Frame::Overflow { discarded } => {
            ctx.stats.record_parse_error();
            ctx.events.publish(BoardEvent::ParseError {
                line: String::new(),
                reason: format!("line too long ({discarded} bytes discarded)"),
            });
            return;
        }
    };

    let text = match std::str::from_utf8(&bytes) {
        Ok(text) => text,
        Err(e) => {
            let line = String::from_utf8_lossy(&bytes).trim().to_string();
            tracing::warn!(port = %ctx.name, line = %line, "non-UTF-8 line");
            ctx.stats.record_parse_error();
            ctx.events.publish(BoardEvent::ParseError {
                line,
                reason: format!("invalid UTF-8: {e}"),
            });
            return;
        }
    };

    let line = text.trim();
    if line.is_empty() {
        return;
    }
    tracing::trace!(port = %ctx.name, line = %line, "received line");

    match codec::parse_message(line) {
        Ok(InboundMessage::Response(resp)) => dispatch_response(resp, ctx),
        Ok(InboundMessage::Event(event)) => {
            ctx.stats.record_event();
            ctx.events.publish(event);
        }
        Err(e) => {
            tracing::warn!(port = %ctx.name, error = %e, line = %line, "failed to parse line");
            ctx.stats.record_parse_error();
            ctx.events.publish(BoardEvent::ParseError {
                line: line.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

fn dispatch_response(resp: Response, ctx: &ReaderContext) {
    let Some(id) = resp.response_to.clone() else {
        tracing::debug!(port = %ctx.name, status = %resp.status, "response without id, discarding");
        ctx.stats.record_orphan();
        return;
    };

    let ok = resp.status.is_ok();
    match ctx.pending.resolve(id.as_str(), resp) {
        Some(resolved) => {
            tracing::trace!(
                id = %id,
                command = resolved.command,
                rtt_ms = resolved.round_trip.as_millis() as u64,
                "response matched"
            );
            ctx.stats.record_response(resolved.round_trip, ok);
        }
        None => {
            tracing::debug!(port = %ctx.name, id = %id, "response for unknown or expired request");
            ctx.stats.record_orphan();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_core::events::PinUpdate;
    use boardlink_core::types::ResponseStatus;
    use boardlink_test_harness::MockBoard;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, ReadBuf};

    fn client_and_board() -> (BoardClient, MockBoard) {
        let (transport, board) = MockBoard::pair();
        (BoardClient::connect(transport, ClientOptions::default()), board)
    }

    fn d(n: u8) -> PinName {
        PinName::Digital(n)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn request_line_layout() {
        let (client, mut board) = client_and_board();

        let pending = client
            .submit(Command::DigitalWrite { pin: d(13), value: 1 }, LONG)
            .await
            .unwrap();
        let req = board.read_request().await.unwrap();
        assert_eq!(
            req.raw,
            json!({"id": pending.id().as_str(), "command": "digital_write", "pin": "D13", "value": 1})
        );
        board.respond_ok(&req.id, None).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), None);
    }

    #[tokio::test]
    async fn response_value_is_returned() {
        let (client, mut board) = client_and_board();
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board.respond_ok(&req.id, Some(json!(612))).await.unwrap();
            board
        });

        let v = client.analog_read(PinName::Analog(0)).await.unwrap();
        assert_eq!(v, 612);
        server.await.unwrap();
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn device_error_status() {
        let (client, mut board) = client_and_board();
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board.respond(&req.id, "invalid_pin", None).await.unwrap();
            board
        });

        let err = client.digital_read(d(42)).await.unwrap_err();
        match err {
            Error::Device { status } => assert_eq!(status, ResponseStatus::InvalidPin),
            other => panic!("expected device error, got {other:?}"),
        }
        server.await.unwrap();
        assert_eq!(client.stats().device_errors, 1);
    }

    #[tokio::test]
    async fn out_of_order_responses_are_correlated() {
        let (client, mut board) = client_and_board();

        let p1 = client
            .submit(Command::AnalogRead { pin: PinName::Analog(1) }, LONG)
            .await
            .unwrap();
        let p2 = client
            .submit(Command::AnalogRead { pin: PinName::Analog(2) }, LONG)
            .await
            .unwrap();
        let reqs = board.read_requests(2).await.unwrap();

        // r2 answered before r1.
        board.respond_ok(&reqs[1].id, Some(json!(222))).await.unwrap();
        board.respond_ok(&reqs[0].id, Some(json!(111))).await.unwrap();

        assert_eq!(p2.wait().await.unwrap(), Some(json!(222)));
        assert_eq!(p1.wait().await.unwrap(), Some(json!(111)));
    }

    #[tokio::test]
    async fn concurrent_issuers_each_get_their_answer() {
        let (client, mut board) = client_and_board();
        let client = Arc::new(client);

        let server = tokio::spawn(async move {
            let reqs = board.read_requests(3).await.unwrap();
            for req in reqs.iter().rev() {
                let Command::AnalogRead { pin } = req.command else {
                    panic!("unexpected command");
                };
                board
                    .respond_ok(&req.id, Some(json!(pin.index() as u64 * 100)))
                    .await
                    .unwrap();
            }
            board
        });

        let (a, b, c) = tokio::join!(
            client.analog_read(PinName::Analog(1)),
            client.analog_read(PinName::Analog(2)),
            client.analog_read(PinName::Analog(3)),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (100, 200, 300));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_response_to_leaves_pending_untouched() {
        let (client, mut board) = client_and_board();
        let pending = client.submit(Command::GetPinStates, LONG).await.unwrap();
        let req = board.read_request().await.unwrap();

        board.respond_ok(&RequestId::from("r999"), None).await.unwrap();
        board
            .write_line(r#"{"type":"response","status":"ok"}"#)
            .await
            .unwrap();
        board.respond_ok(&req.id, None).await.unwrap();

        assert_eq!(pending.wait().await.unwrap(), None);
        assert_eq!(client.stats().orphaned_responses, 2);
    }

    #[tokio::test]
    async fn legacy_id_field_resolves() {
        let (client, mut board) = client_and_board();
        let pending = client.submit(Command::Reset, LONG).await.unwrap();
        let req = board.read_request().await.unwrap();
        board
            .write_line(&format!(r#"{{"type":"response","status":"ok","id":"{}"}}"#, req.id))
            .await
            .unwrap();
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_orphans_late_response() {
        let (client, mut board) = client_and_board();

        let err = client
            .issue(Command::DigitalRead { pin: d(2) }, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(client.pending_count(), 0);

        let req = board.read_request().await.unwrap();
        board.respond_ok(&req.id, Some(json!(1))).await.unwrap();

        // The link stays usable and the late response is orphaned.
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board.respond_ok(&req.id, None).await.unwrap();
            board
        });
        client.reset().await.unwrap();
        server.await.unwrap();

        let stats = client.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.orphaned_responses, 1);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn response_just_before_deadline_wins() {
        let (client, mut board) = client_and_board();
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            tokio::time::sleep(Duration::from_millis(99)).await;
            board.respond_ok(&req.id, Some(json!(7))).await.unwrap();
            board
        });

        let v = client
            .issue(Command::AnalogRead { pin: PinName::Analog(0) }, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(v, Some(json!(7)));
        server.await.unwrap();
        assert_eq!(client.stats().timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_the_deadline() {
        let (client, mut board) = client_and_board();
        let start = Instant::now();

        let pending = client
            .submit(Command::DigitalRead { pin: d(2) }, Duration::from_millis(100))
            .await
            .unwrap();
        let _req = board.read_request().await.unwrap();
        let wait = pending.wait();
        tokio::pin!(wait);

        tokio::time::sleep_until(start + Duration::from_millis(99)).await;
        assert_eq!(client.pending_count(), 1);
        tokio::select! {
            biased;
            _ = &mut wait => panic!("resolved before the deadline"),
            _ = std::future::ready(()) => {}
        }

        let err = wait.await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn stalled_write_never_leaves_a_partial_line() {
        let (host, device) = tokio::io::duplex(16);
        let client = BoardClient::connect(host, ClientOptions::default());

        // Nobody reads the device end yet, so the first line stalls after
        // sixteen bytes and its caller times out.
        let err = client
            .issue(Command::DigitalWrite { pin: d(13), value: 1 }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(client.stats().timeouts, 1);
        assert_eq!(client.pending_count(), 0);

        let (read_half, _write_half) = tokio::io::split(device);
        let mut lines = tokio::io::BufReader::new(read_half).lines();
        let device_side = async {
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        };
        let (pending, (first, second)) =
            tokio::join!(client.submit(Command::Reset, LONG), device_side);
        let pending = pending.unwrap();

        let first: Value = serde_json::from_str(&first).unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(first["command"], "digital_write");
        assert_eq!(second, json!({"id": pending.id().as_str(), "command": "reset"}));
    }

    /// Passes `budget` bytes to the inner stream, then fails every write.
    struct BrittleLink {
        inner: tokio::io::DuplexStream,
        budget: usize,
    }

    impl AsyncRead for BrittleLink {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrittleLink {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            if this.budget == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(this.budget);
            let polled = Pin::new(&mut this.inner).poll_write(cx, &buf[..n]);
            if let Poll::Ready(Ok(written)) = polled {
                this.budget -= written;
            }
            polled
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    impl Transport for BrittleLink {
        fn name(&self) -> &str {
            "brittle"
        }
    }

    #[tokio::test]
    async fn write_failure_closes_the_link() {
        let (host, mut board) = MockBoard::pair();
        let link = BrittleLink {
            inner: host,
            budget: 64,
        };
        let client = BoardClient::connect(link, ClientOptions::default());
        let mut events = client.subscribe(&[EventTag::Connection]);

        let first = client.submit(Command::Reset, LONG).await.unwrap();
        let req = board.read_request().await.unwrap();
        assert!(matches!(req.command, Command::Reset));

        // Larger than what is left of the budget, so it fails part way.
        let big = Command::ConfigureSensorPin {
            sensor_type: SensorId::from("ULTRASONIC"),
            pin_config: json!({"note": "x".repeat(256)}),
        };
        let err = client.submit(big, LONG).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {err:?}");

        assert!(matches!(first.wait().await, Err(Error::ConnectionLost)));
        assert!(!client.is_connected());
        assert!(matches!(events.recv().await, Some(BoardEvent::Disconnected)));
        assert!(matches!(
            client.issue(Command::Reset, LONG).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn cancel_resolves_immediately_and_orphans_response() {
        let (client, mut board) = client_and_board();
        let pending = client.submit(Command::ReadSensor { sensor: "DHT11".into() }, LONG).await.unwrap();
        let id = pending.id().clone();

        assert!(client.cancel(&id));
        assert!(!client.cancel(&id));
        assert!(matches!(pending.wait().await, Err(Error::Cancelled)));

        let req = board.read_request().await.unwrap();
        board.respond_ok(&req.id, Some(json!(21.5))).await.unwrap();

        // Round-trip a second request to be sure the late line was processed.
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board.respond_ok(&req.id, None).await.unwrap();
            board
        });
        client.reset().await.unwrap();
        server.await.unwrap();
        assert_eq!(client.stats().orphaned_responses, 1);
        assert_eq!(client.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn dropping_pending_request_abandons_it() {
        let (client, _board) = client_and_board();
        let pending = client.submit(Command::GetPinStates, LONG).await.unwrap();
        assert_eq!(client.pending_count(), 1);
        drop(pending);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn transport_close_fails_all_pending() {
        let (client, mut board) = client_and_board();
        let mut conn = client.subscribe(&[EventTag::Connection]);

        let mut waiting = Vec::new();
        for n in 0..4 {
            waiting.push(client.submit(Command::DigitalRead { pin: d(n) }, LONG).await.unwrap());
        }
        board.read_requests(4).await.unwrap();
        board.disconnect();

        for p in waiting {
            assert!(matches!(p.wait().await, Err(Error::ConnectionLost)));
        }
        assert_eq!(conn.recv().await, Some(BoardEvent::Disconnected));
        assert!(!client.is_connected());
        assert_eq!(client.pending_count(), 0);

        let err = client.reset().await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn malformed_line_is_reported_and_skipped() {
        let (client, mut board) = client_and_board();
        let mut parse_errors = client.subscribe(&[EventTag::ParseError]);
        let mut statuses = client.subscribe(&[EventTag::Status]);

        board.write_line(r#"{"id":"#).await.unwrap();
        board
            .write_line(r#"{"type":"status","message":"still alive"}"#)
            .await
            .unwrap();

        match parse_errors.recv().await {
            Some(BoardEvent::ParseError { line, .. }) => assert_eq!(line, r#"{"id":"#),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert_eq!(
            statuses.recv().await,
            Some(BoardEvent::Status {
                message: "still alive".into()
            })
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn blank_and_crlf_lines_are_tolerated() {
        let (client, mut board) = client_and_board();
        let mut pins = client.subscribe(&[EventTag::PinUpdate]);
        let mut parse_errors = client.subscribe(&[EventTag::ParseError]);

        board
            .write_raw(b"\n\r\n{\"type\":\"pin_update\",\"pin_name\":\"D3\",\"value\":1}\r\n")
            .await
            .unwrap();
        assert!(matches!(pins.recv().await, Some(BoardEvent::PinUpdate(_))));
        assert!(parse_errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn sensor_update_reaches_every_subscriber() {
        let (client, mut board) = client_and_board();
        let mut a = client.subscribe(&[EventTag::SensorUpdate]);
        let mut b = client.subscribe(&[EventTag::SensorUpdate, EventTag::PinUpdate]);
        let mut other = client.subscribe(&[EventTag::PinUpdate]);

        board
            .write_line(r#"{"type":"sensor_update","sensor":"B24_TEMP","value":22.4,"unit":"C"}"#)
            .await
            .unwrap();

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(BoardEvent::SensorUpdate(r)) => {
                    assert_eq!(r.sensor, "B24_TEMP");
                    assert_eq!(r.value, Some(22.4));
                }
                other => panic!("expected sensor update, got {other:?}"),
            }
        }
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn digital_write_then_pin_update() {
        let (client, mut board) = client_and_board();
        let mut pins = client.subscribe(&[EventTag::PinUpdate]);

        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            assert_eq!(req.raw["command"], "digital_write");
            board.respond_ok(&req.id, Some(json!(1))).await.unwrap();
            board.pin_update("D13", 1).await.unwrap();
            board
        });

        client.digital_write(d(13), true).await.unwrap();
        assert_eq!(
            pins.recv().await,
            Some(BoardEvent::PinUpdate(PinUpdate {
                pin_name: "D13".into(),
                value: 1
            }))
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_type_is_published_as_unknown() {
        let (client, mut board) = client_and_board();
        let mut unknown = client.subscribe(&[EventTag::Unknown]);
        board.write_line(r#"{"type":"pong","uptime":12}"#).await.unwrap();
        match unknown.recv().await {
            Some(BoardEvent::Unknown { kind, raw }) => {
                assert_eq!(kind.as_deref(), Some("pong"));
                assert_eq!(raw["uptime"], 12);
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlong_line_is_a_parse_error() {
        let (transport, mut board) = MockBoard::pair();
        let client = BoardClient::connect(
            transport,
            ClientOptions {
                max_line: 64,
                ..ClientOptions::default()
            },
        );
        let mut parse_errors = client.subscribe(&[EventTag::ParseError]);
        let mut statuses = client.subscribe(&[EventTag::Status]);

        let long = format!(r#"{{"type":"status","message":"{}"}}"#, "x".repeat(200));
        board.write_line(&long).await.unwrap();
        board.write_line(r#"{"type":"status","message":"ok"}"#).await.unwrap();

        assert!(matches!(
            parse_errors.recv().await,
            Some(BoardEvent::ParseError { .. })
        ));
        assert_eq!(
            statuses.recv().await,
            Some(BoardEvent::Status {
                message: "ok".into()
            })
        );
    }

    #[tokio::test]
    async fn invalid_parameters_fail_before_io() {
        let (client, mut board) = client_and_board();
        let err = client.servo_write(d(9), 200).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        assert_eq!(client.stats().commands_sent, 0);

        client.disconnect().await.unwrap();
        board.wait_closed().await.unwrap();
        assert!(board.received().is_empty());
    }

    #[tokio::test]
    async fn disconnect_resolves_pending_and_publishes() {
        let (client, mut board) = client_and_board();
        let mut conn = client.subscribe(&[EventTag::Connection]);
        let pending = client.submit(Command::GetPinStates, LONG).await.unwrap();
        board.read_request().await.unwrap();

        client.disconnect().await.unwrap();
        assert!(matches!(pending.wait().await, Err(Error::ConnectionLost)));
        assert_eq!(conn.try_recv(), Some(BoardEvent::Disconnected));
        assert!(!client.is_connected());

        // Second disconnect is a no-op.
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn pin_states_from_response_value() {
        let (client, mut board) = client_and_board();
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board
                .respond_ok(
                    &req.id,
                    Some(json!({
                        "digital": [{"pin": "D13", "mode": "OUTPUT", "value": 1}],
                        "analog": [{"pin": "A0", "value": 300}],
                    })),
                )
                .await
                .unwrap();
            board
        });
        let states = client.get_pin_states().await.unwrap().unwrap();
        assert_eq!(states.digital[0].pin, "D13");
        assert_eq!(states.analog[0].value, 300);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_policy_by_class() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.for_class(CommandClass::Pin), Duration::from_secs(1));
        assert_eq!(policy.for_class(CommandClass::Sensor), Duration::from_secs(3));
        assert_eq!(
            TimeoutPolicy::uniform(Duration::from_millis(250)).for_class(CommandClass::Config),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn round_trip_is_measured() {
        let (client, mut board) = client_and_board();
        let server = tokio::spawn(async move {
            let req = board.read_request().await.unwrap();
            board.respond_ok(&req.id, None).await.unwrap();
            board
        });
        client.reset().await.unwrap();
        server.await.unwrap();
        let stats = client.stats();
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert!(stats.avg_response_time.is_some());
    }
}
