//! Transport trait for board communication.
//!
//! A [`Transport`] is a full-duplex byte stream to a board. The client
//! splits it into a read half owned by a reader task and a write half owned
//! by a writer task, so the trait is expressed in terms of tokio's
//! [`AsyncRead`] and [`AsyncWrite`] rather than request/response calls.
//!
//! Implementations exist for serial ports (`boardlink-transport`), the
//! in-process simulator (`boardlink-test-harness`), and tokio's in-memory
//! [`DuplexStream`] used by tests.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Asynchronous byte stream to a board.
///
/// Framing (newline-delimited JSON) is handled by the protocol layer; a
/// transport only moves bytes.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable name of the link, used in log fields
    /// (e.g. `/dev/ttyACM0`, `COM3`, `simulator`).
    fn name(&self) -> &str;
}

impl Transport for DuplexStream {
    fn name(&self) -> &str {
        "duplex"
    }
}
