//! Framing for miner connections.
//!
//! Stratum v1 is JSON-RPC over TCP. [`StratumCodec`] turns a byte stream
//! into [`JsonRpcMessage`]s and back; how one message is delimited from the
//! next is the job of a [`WireCodec`]. The standard framing is one JSON
//! document per line ([`JsonLines`]). [`LengthPrefixed`] carries the same
//! documents behind a 4-byte big-endian length, which suits miners that
//! submit large proofs.
//!
//! ```text
//! +-----------+---------------------+
//! |  Length   |       Payload       |
//! |  4 bytes  |   (Length bytes)    |
//! +-----------+---------------------+
//! ```
//!
//! [`Connection`] wraps a framed TCP stream. The [`Transport`] trait
//! abstracts message I/O, allowing channel-based mocks for deterministic
//! testing.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use strum::Display;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line accepted from a miner. Submits are well under 1 KiB.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Largest length-prefixed payload, in either direction.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

const LENGTH_SIZE: usize = 4;

/// Message-level I/O for Stratum protocol.
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    /// Write a JSON-RPC message.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// Delimits message payloads on the wire.
pub trait WireCodec: Debug + Send {
    /// Split the next payload off the front of `src`.
    ///
    /// Returns `None` until a whole payload has arrived.
    fn deframe(&mut self, src: &mut BytesMut) -> StratumResult<Option<Bytes>>;

    /// As [`WireCodec::deframe`], once the peer has stopped sending.
    fn deframe_eof(&mut self, src: &mut BytesMut) -> StratumResult<Option<Bytes>> {
        match self.deframe(src)? {
            Some(payload) => Ok(Some(payload)),
            None if src.is_empty() => Ok(None),
            None => Err(StratumError::Malformed(format!(
                "connection closed inside a frame, {} bytes pending",
                src.len()
            ))),
        }
    }

    /// Append `payload`, framed, to `dst`.
    fn frame(&mut self, payload: &[u8], dst: &mut BytesMut) -> StratumResult<()>;
}

/// Wire codecs a server can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WireCodecKind {
    #[default]
    JsonLines,
    LengthPrefixed,
}

impl WireCodecKind {
    pub fn codec(self) -> Box<dyn WireCodec> {
        match self {
            WireCodecKind::JsonLines => Box::new(JsonLines::new()),
            WireCodecKind::LengthPrefixed => Box::new(LengthPrefixed::new()),
        }
    }
}

/// Newline-delimited payloads. Blank lines are skipped.
#[derive(Debug)]
pub struct JsonLines {
    lines: LinesCodec,
}

impl JsonLines {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Default for JsonLines {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for JsonLines {
    fn deframe(&mut self, src: &mut BytesMut) -> StratumResult<Option<Bytes>> {
        loop {
            match self.lines.decode(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(Bytes::from(line.trim().to_owned()))),
                None => return Ok(None),
            }
        }
    }

    fn deframe_eof(&mut self, src: &mut BytesMut) -> StratumResult<Option<Bytes>> {
        loop {
            match self.lines.decode_eof(src)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(Bytes::from(line.trim().to_owned()))),
                None => return Ok(None),
            }
        }
    }

    fn frame(&mut self, payload: &[u8], dst: &mut BytesMut) -> StratumResult<()> {
        dst.reserve(payload.len() + 1);
        dst.put_slice(payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Payloads behind a 4-byte big-endian length.
#[derive(Debug)]
pub struct LengthPrefixed {
    max_length: usize,
}

impl LengthPrefixed {
    pub fn new() -> Self {
        Self {
            max_length: MAX_FRAME_LENGTH,
        }
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec for LengthPrefixed {
    fn deframe(&mut self, src: &mut BytesMut) -> StratumResult<Option<Bytes>> {
        if src.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(StratumError::Malformed("empty frame".into()));
        }
        if length > self.max_length {
            return Err(StratumError::MessageTooLong(self.max_length));
        }

        if src.len() < LENGTH_SIZE + length {
            src.reserve(LENGTH_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn frame(&mut self, payload: &[u8], dst: &mut BytesMut) -> StratumResult<()> {
        if payload.len() > self.max_length {
            return Err(StratumError::MessageTooLong(self.max_length));
        }
        dst.reserve(LENGTH_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Codec for JSON-RPC messages over a [`WireCodec`].
///
/// A payload that is not valid JSON-RPC decodes to
/// [`StratumError::Malformed`].
#[derive(Debug)]
pub struct StratumCodec {
    wire: Box<dyn WireCodec>,
}

impl StratumCodec {
    /// Newline-delimited JSON.
    pub fn new() -> Self {
        Self::with_wire(WireCodecKind::JsonLines)
    }

    pub fn with_wire(kind: WireCodecKind) -> Self {
        Self { wire: kind.codec() }
    }

    fn parse(payload: &[u8]) -> StratumResult<JsonRpcMessage> {
        let text = String::from_utf8_lossy(payload);
        trace!(rx = %text, "Received message");
        serde_json::from_slice(payload).map_err(|e| {
            StratumError::Malformed(format!("failed to parse JSON: {}, message: {}", e, text))
        })
    }
}

impl Default for StratumCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StratumCodec {
    type Item = JsonRpcMessage;
    type Error = StratumError;

    fn decode(&mut self, src: &mut BytesMut) -> StratumResult<Option<JsonRpcMessage>> {
        self.wire
            .deframe(src)?
            .map(|payload| Self::parse(&payload))
            .transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> StratumResult<Option<JsonRpcMessage>> {
        self.wire
            .deframe_eof(src)?
            .map(|payload| Self::parse(&payload))
            .transpose()
    }
}

impl Encoder<&JsonRpcMessage> for StratumCodec {
    type Error = StratumError;

    fn encode(&mut self, msg: &JsonRpcMessage, dst: &mut BytesMut) -> StratumResult<()> {
        let json = serde_json::to_vec(msg)?;
        trace!(tx = %String::from_utf8_lossy(&json), "Sending message");
        self.wire.frame(&json, dst)
    }
}

/// A miner's TCP connection.
pub struct Connection {
    framed: Framed<TcpStream, StratumCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_codec(stream, StratumCodec::new())
    }

    pub fn with_codec(stream: TcpStream, codec: StratumCodec) -> Self {
        Self {
            framed: Framed::new(stream, codec),
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        self.framed.next().await.transpose()
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.framed.send(msg).await
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// session's side, the handle is the test's side (playing the miner).
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<StratumResult<JsonRpcMessage>>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<StratumResult<JsonRpcMessage>>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (session_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, session_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: session_rx,
            tx: session_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        match self.rx.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the session.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(Ok(msg)).expect("transport dropped");
    }

    /// Make the session's next read fail, as with unparseable bytes.
    pub fn send_garbage(&self) {
        self.tx
            .send(Err(StratumError::Malformed("garbage".into())))
            .expect("transport dropped");
    }

    /// Receive a message the session wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive a message, or `None` once the session has hung up.
    pub async fn try_recv(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }
}
