//! Scripted board for protocol-level testing.
//!
//! [`MockBoard`] holds the device end of an in-memory duplex pipe. The test
//! hands the host end to the client as its transport, then drives the board
//! side by hand: read the request the client wrote, answer it (or not, or
//! out of order), push unsolicited lines, or hang up.
//!
//! # Example
//!
//! ```
//! use boardlink_test_harness::MockBoard;
//!
//! # async fn example() -> boardlink_core::Result<()> {
//! let (transport, mut board) = MockBoard::pair();
//! // ... connect a client to `transport` and issue a command ...
//! let req = board.read_request().await?;
//! board.respond_ok(&req.id, Some(serde_json::json!(1))).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use boardlink_core::error::{Error, Result};
use boardlink_core::types::RequestId;
use boardlink_protocol::codec::{Command, decode_request};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

/// Pipe capacity for each direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// How long `read_*` waits for the client before giving up.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A request as read by the mock board.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub id: RequestId,
    pub command: Command,
    /// The full request object, for asserting on field layout.
    pub raw: Value,
}

/// The device side of a duplex pipe, driven by test code.
pub struct MockBoard {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    /// Log of every line read from the client.
    received: Vec<String>,
}

impl MockBoard {
    /// Create a connected pair: the host end (a transport for the client)
    /// and the scripted board.
    pub fn pair() -> (DuplexStream, MockBoard) {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let (read_half, write_half) = tokio::io::split(device);
        let board = MockBoard {
            reader: BufReader::new(read_half),
            writer: write_half,
            received: Vec::new(),
        };
        (host, board)
    }

    /// Read one raw line from the client, without its terminator.
    ///
    /// Returns `Ok(None)` when the client closed its end and
    /// [`Error::Timeout`] when nothing arrives within 5 seconds.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        tracing::trace!(line = %line, "mock board received");
        self.received.push(line.clone());
        Ok(Some(line))
    }

    /// Read and decode the next request.
    pub async fn read_request(&mut self) -> Result<ReceivedRequest> {
        let line = self.read_line().await?.ok_or(Error::ConnectionLost)?;
        let raw: Value = serde_json::from_str(&line)?;
        let (id, command) = decode_request(&line)?;
        Ok(ReceivedRequest { id, command, raw })
    }

    /// Read the next `n` requests, in the order the client wrote them.
    pub async fn read_requests(&mut self, n: usize) -> Result<Vec<ReceivedRequest>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_request().await?);
        }
        Ok(out)
    }

    /// Write raw bytes exactly as given (no terminator added).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Write one line, adding the `\n` terminator.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write_raw(&bytes).await
    }

    /// Write a JSON message as one line.
    pub async fn send(&mut self, msg: &Value) -> Result<()> {
        self.write_line(&msg.to_string()).await
    }

    /// Answer a request with the given status token.
    pub async fn respond(&mut self, id: &RequestId, status: &str, value: Option<Value>) -> Result<()> {
        let mut msg = json!({
            "type": "response",
            "status": status,
            "response_to": id.as_str(),
        });
        if let Some(value) = value {
            msg["value"] = value;
        }
        self.send(&msg).await
    }

    /// Answer a request with `status: "ok"`.
    pub async fn respond_ok(&mut self, id: &RequestId, value: Option<Value>) -> Result<()> {
        self.respond(id, "ok", value).await
    }

    /// Push an unsolicited `pin_update`.
    pub async fn pin_update(&mut self, pin_name: &str, value: i64) -> Result<()> {
        self.send(&json!({"type": "pin_update", "pin_name": pin_name, "value": value}))
            .await
    }

    /// Every line read from the client so far.
    pub fn received(&self) -> &[String] {
        &self.received
    }

    /// Wait until the client closes its end of the pipe.
    pub async fn wait_closed(&mut self) -> Result<()> {
        while self.read_line().await?.is_some() {}
        Ok(())
    }

    /// Hang up: the client's reader sees end-of-stream.
    pub fn disconnect(self) {
        drop(self);
    }
}
