// MIT License - Copyright (c) 2026 Peter Wright

//! NX-584 wire framing: byte stuffing, Fletcher-16 checksums, and the
//! framed reader/writer over an async byte stream.
//!
//! Wire layout (after stuffing everything past the start byte):
//!
//! ```text
//! [0x7E][length][msg_type][data... (length-1 bytes)][cksum_lo][cksum_hi]
//! ```
//!
//! `length` counts the message type byte plus its data. The checksum is
//! computed over the unstuffed bytes from `length` through the last data
//! byte.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout};
use tracing::trace;

use crate::protocol::{MessageSpec, MessageType};

/// Frame start marker. Never appears inside a stuffed frame body.
pub const START_BYTE: u8 = 0x7E;
/// Escape marker for byte stuffing.
pub const ESCAPE_BYTE: u8 = 0x7D;
const ESCAPED_START: u8 = 0x5E;
const ESCAPED_ESCAPE: u8 = 0x5D;

/// Bit 7 of the message type byte: the sender requests an ACK.
pub const ACK_REQUEST_BIT: u8 = 0x80;
/// Low six bits of the message type byte identify the message.
pub const TYPE_MASK: u8 = 0x3F;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("read timed out")]
    Timeout,

    #[error("invalid escape sequence 0x7d 0x{0:02x}")]
    BadEscape(u8),

    #[error("invalid length {got} for message type 0x{msg_type:02x}")]
    BadLength { msg_type: u8, got: u8 },

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("serial link closed")]
    Closed,

    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Closed | FrameError::Io(_))
    }
}

/// A validated inbound message: catalog-checked type, ACK-request bit, and
/// the data bytes following the type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub ack_requested: bool,
    pub body: Vec<u8>,
}

/// Compute the Fletcher-16 checksum, returned as `[sum1, sum2]` in wire
/// order (low byte first).
pub fn fletcher16(data: &[u8]) -> [u8; 2] {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + u16::from(byte)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    [sum1 as u8, sum2 as u8]
}

/// Apply byte stuffing: `0x7E` -> `0x7D 0x5E`, `0x7D` -> `0x7D 0x5D`.
pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            START_BYTE => out.extend_from_slice(&[ESCAPE_BYTE, ESCAPED_START]),
            ESCAPE_BYTE => out.extend_from_slice(&[ESCAPE_BYTE, ESCAPED_ESCAPE]),
            other => out.push(other),
        }
    }
    out
}

/// Reverse byte stuffing. Any `0x7D` not followed by `0x5E` or `0x5D` is a
/// frame error.
pub fn unstuff(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == ESCAPE_BYTE {
            match iter.next() {
                Some(&ESCAPED_START) => out.push(START_BYTE),
                Some(&ESCAPED_ESCAPE) => out.push(ESCAPE_BYTE),
                Some(&other) => return Err(FrameError::BadEscape(other)),
                None => return Err(FrameError::BadEscape(0)),
            }
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Framed serial link to the panel.
///
/// Generic over the byte stream so tests can drive it with an in-memory
/// duplex pipe instead of a serial device.
pub struct PanelLink<T> {
    stream: T,
    read_timeout: Duration,
    poll_timeout: Duration,
}

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);
const FLUSH_PROBE: Duration = Duration::from_millis(5);

impl<T: AsyncRead + AsyncWrite + Unpin> PanelLink<T> {
    pub fn new(stream: T) -> Self {
        Self::with_timeouts(stream, DEFAULT_READ_TIMEOUT, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_timeouts(stream: T, read_timeout: Duration, poll_timeout: Duration) -> Self {
        Self { stream, read_timeout, poll_timeout }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    /// Read one complete frame.
    ///
    /// `blocking` selects how long to wait for the frame to start: the full
    /// read timeout, or a short poll suitable for the controller main loop.
    /// On any framing, length, or checksum error the serial input is
    /// flushed before the error is returned; the caller decides whether to
    /// retry.
    pub async fn read_frame(&mut self, blocking: bool) -> Result<Frame, FrameError> {
        let wait = if blocking { self.read_timeout } else { self.poll_timeout };
        self.read_frame_within(wait).await
    }

    /// Like [`read_frame`](Self::read_frame) with an explicit bound on the
    /// wait for the start of the frame.
    pub async fn read_frame_within(&mut self, wait: Duration) -> Result<Frame, FrameError> {
        // Frame boundary detection: hunt for the start byte, discarding
        // anything in between.
        let scan_deadline = Instant::now() + wait;
        loop {
            match self.read_raw(scan_deadline).await? {
                START_BYTE => break,
                other => trace!("Discarding byte 0x{other:02x} while looking for frame start"),
            }
        }

        match self.read_frame_after_start().await {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.flush_input().await;
                Err(e)
            }
        }
    }

    async fn read_frame_after_start(&mut self) -> Result<Frame, FrameError> {
        let deadline = Instant::now() + self.read_timeout;
        let length = self.read_unstuffed(deadline).await?;
        if length == 0 {
            return Err(FrameError::BadLength { msg_type: 0, got: 0 });
        }

        // length data bytes (type included) plus the two checksum bytes.
        let mut message = Vec::with_capacity(usize::from(length) + 3);
        message.push(length);
        for _ in 0..usize::from(length) + 2 {
            message.push(self.read_unstuffed(deadline).await?);
        }

        let (checked, checksum) = message.split_at(message.len() - 2);
        if fletcher16(checked) != [checksum[0], checksum[1]] {
            return Err(FrameError::BadChecksum);
        }

        let type_byte = message[1];
        let code = type_byte & TYPE_MASK;
        let Some(spec) = MessageSpec::for_code(code) else {
            return Err(FrameError::UnknownType(code));
        };
        if length != spec.valid_length {
            return Err(FrameError::BadLength { msg_type: code, got: length });
        }

        Ok(Frame {
            msg_type: spec.msg_type,
            ack_requested: type_byte & ACK_REQUEST_BIT != 0,
            body: message[2..1 + usize::from(length)].to_vec(),
        })
    }

    /// Build, checksum, stuff, and transmit one frame.
    pub async fn write_frame(
        &mut self,
        msg_type: MessageType,
        body: &[u8],
        request_ack: bool,
    ) -> Result<(), FrameError> {
        let length = body.len() as u8 + 1;
        let spec = MessageSpec::of(msg_type);
        if length != spec.valid_length {
            return Err(FrameError::BadLength { msg_type: msg_type.code(), got: length });
        }

        let mut message = Vec::with_capacity(body.len() + 4);
        message.push(length);
        let mut type_byte = msg_type.code();
        if request_ack {
            type_byte |= ACK_REQUEST_BIT;
        }
        message.push(type_byte);
        message.extend_from_slice(body);
        let checksum = fletcher16(&message);
        message.extend_from_slice(&checksum);

        let mut wire = Vec::with_capacity(message.len() + 1);
        wire.push(START_BYTE);
        wire.extend(stuff(&message));

        trace!("Sending frame: {:02x?}", wire);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Discard whatever is pending on the input side.
    pub async fn flush_input(&mut self) {
        let mut scratch = [0u8; 64];
        while let Ok(Ok(n)) = timeout(FLUSH_PROBE, self.stream.read(&mut scratch)).await {
            if n == 0 {
                break;
            }
            trace!("Flushed {n} bytes of serial input");
        }
    }

    async fn read_unstuffed(&mut self, deadline: Instant) -> Result<u8, FrameError> {
        let byte = self.read_raw(deadline).await?;
        if byte != ESCAPE_BYTE {
            return Ok(byte);
        }
        match self.read_raw(deadline).await? {
            ESCAPED_START => Ok(START_BYTE),
            ESCAPED_ESCAPE => Ok(ESCAPE_BYTE),
            other => Err(FrameError::BadEscape(other)),
        }
    }

    async fn read_raw(&mut self, deadline: Instant) -> Result<u8, FrameError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FrameError::Timeout);
        }
        match timeout(remaining, self.stream.read_u8()).await {
            Ok(Ok(byte)) => Ok(byte),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(FrameError::Closed)
            }
            Ok(Err(e)) => Err(FrameError::Io(e)),
            Err(_) => Err(FrameError::Timeout),
        }
    }
}
