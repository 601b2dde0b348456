//! Gather wire format — the messages exchanged between receiver and senders.
//!
//! Control messages travel as colon-delimited text:
//!
//!   REQUEST:<filename>                                   (UDP, broadcast)
//!   ACK:<sender_id>:<filename>:<file_size>               (UDP, reply)
//!   ASSIGN:<sender_id>:<filename>:<start>:<end>:<ipv4>   (TCP, one per sender)
//!
//! CHUNK carries raw file bytes, which may contain the delimiter, so it is
//! length-framed instead of split:
//!
//!   [u32 BE header_len][CHUNK:<sender_id>:<filename>:<start>:<end>][data]
//!
//! The data length is implied by the range and checked on decode, so a
//! stream that closes early is detected rather than silently truncated.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Discovery port, assignment base port and receiver transfer port.
pub const DEFAULT_PORT: u16 = 5000;

/// Read buffer for datagrams and assignment messages.
pub const BUFFER_SIZE: usize = 4096;

/// Field separator for every text message.
pub const FIELD_DELIMITER: char = ':';

pub const TAG_REQUEST: &str = "REQUEST";
pub const TAG_ACK: &str = "ACK";
pub const TAG_ASSIGN: &str = "ASSIGN";
pub const TAG_CHUNK: &str = "CHUNK";

/// Largest CHUNK header accepted. Anything bigger is a corrupt frame.
pub const MAX_CHUNK_HEADER: usize = BUFFER_SIZE;

/// Externally supplied sender identity. Also the sender's port offset.
pub type SenderId = u16;

/// Port on which sender `sender_id` accepts its assignment.
pub fn assignment_port(base_port: u16, sender_id: SenderId) -> Result<u16, WireError> {
    base_port
        .checked_add(sender_id)
        .ok_or(WireError::PortOverflow {
            base_port,
            sender_id,
        })
}

// ── Byte ranges ───────────────────────────────────────────────────────────────

/// Half-open byte range `[start, end)` within the transferred file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self, WireError> {
        if end < start {
            return Err(WireError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ── Control messages ──────────────────────────────────────────────────────────

/// A text control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Receiver asks every sender on the link who holds `filename`.
    Request { filename: String },

    /// A sender announces that it holds `filename` of `file_size` bytes.
    Ack {
        sender_id: SenderId,
        filename: String,
        file_size: u64,
    },

    /// Receiver binds `range` of `filename` to one sender. The sender pushes
    /// the bytes back to `receiver_addr` on the receiver's transfer port.
    ///
    /// IPv4 only: an IPv6 literal contains the field delimiter.
    Assign {
        sender_id: SenderId,
        filename: String,
        range: ByteRange,
        receiver_addr: Ipv4Addr,
    },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Request { .. } => TAG_REQUEST,
            Message::Ack { .. } => TAG_ACK,
            Message::Assign { .. } => TAG_ASSIGN,
        }
    }

    /// Serialize to the text form. Fails if a text field would be ambiguous.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let text = match self {
            Message::Request { filename } => {
                check_text_field("filename", filename)?;
                format!("{TAG_REQUEST}:{filename}")
            }
            Message::Ack {
                sender_id,
                filename,
                file_size,
            } => {
                check_text_field("filename", filename)?;
                format!("{TAG_ACK}:{sender_id}:{filename}:{file_size}")
            }
            Message::Assign {
                sender_id,
                filename,
                range,
                receiver_addr,
            } => {
                check_text_field("filename", filename)?;
                format!(
                    "{TAG_ASSIGN}:{sender_id}:{filename}:{}:{}:{receiver_addr}",
                    range.start, range.end
                )
            }
        };
        Ok(Bytes::from(text))
    }

    /// Parse a text control message.
    ///
    /// Unknown tags yield `WireError::UnknownTag` so callers can drop them
    /// without treating them as corruption.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
        if text.is_empty() {
            return Err(WireError::Empty);
        }

        let fields: Vec<&str> = text.split(FIELD_DELIMITER).collect();
        match fields[0] {
            TAG_REQUEST => {
                expect_fields(TAG_REQUEST, &fields, 2)?;
                Ok(Message::Request {
                    filename: text_field("filename", fields[1])?,
                })
            }
            TAG_ACK => {
                expect_fields(TAG_ACK, &fields, 4)?;
                Ok(Message::Ack {
                    sender_id: number_field("sender_id", fields[1])?,
                    filename: text_field("filename", fields[2])?,
                    file_size: number_field("file_size", fields[3])?,
                })
            }
            TAG_ASSIGN => {
                expect_fields(TAG_ASSIGN, &fields, 6)?;
                let start = number_field("range_start", fields[3])?;
                let end = number_field("range_end", fields[4])?;
                let receiver_addr = fields[5]
                    .parse()
                    .map_err(|_| WireError::InvalidAddress(fields[5].to_string()))?;
                Ok(Message::Assign {
                    sender_id: number_field("sender_id", fields[1])?,
                    filename: text_field("filename", fields[2])?,
                    range: ByteRange::new(start, end)?,
                    receiver_addr,
                })
            }
            TAG_CHUNK => Err(WireError::UnexpectedTag(TAG_CHUNK)),
            other => Err(WireError::UnknownTag(other.to_string())),
        }
    }
}

// ── Chunk payload ─────────────────────────────────────────────────────────────

/// The bytes of one assignment, pushed from a sender to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub sender_id: SenderId,
    pub filename: String,
    pub range: ByteRange,
    pub data: Bytes,
}

impl ChunkPayload {
    /// Build a payload, checking that `data` exactly fills `range`.
    pub fn new(
        sender_id: SenderId,
        filename: impl Into<String>,
        range: ByteRange,
        data: Bytes,
    ) -> Result<Self, WireError> {
        check_payload_len(range, data.len())?;
        Ok(Self {
            sender_id,
            filename: filename.into(),
            range,
            data,
        })
    }

    /// Serialize to a length-framed CHUNK message.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        check_text_field("filename", &self.filename)?;
        check_payload_len(self.range, self.data.len())?;

        let header = format!(
            "{TAG_CHUNK}:{}:{}:{}:{}",
            self.sender_id, self.filename, self.range.start, self.range.end
        );
        if header.len() > MAX_CHUNK_HEADER {
            return Err(WireError::HeaderTooLong(header.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + header.len() + self.data.len());
        buf.put_u32(header.len() as u32);
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Parse a complete CHUNK frame as read from a closed connection.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let header_len = frame.get_u32() as usize;
        if header_len > MAX_CHUNK_HEADER {
            return Err(WireError::HeaderTooLong(header_len));
        }
        if frame.remaining() < header_len {
            return Err(WireError::Truncated);
        }
        let header = frame.split_to(header_len);
        let header = std::str::from_utf8(&header).map_err(|_| WireError::InvalidUtf8)?;

        let fields: Vec<&str> = header.split(FIELD_DELIMITER).collect();
        match fields[0] {
            TAG_CHUNK => {}
            TAG_REQUEST => return Err(WireError::UnexpectedTag(TAG_REQUEST)),
            TAG_ACK => return Err(WireError::UnexpectedTag(TAG_ACK)),
            TAG_ASSIGN => return Err(WireError::UnexpectedTag(TAG_ASSIGN)),
            "" => return Err(WireError::Empty),
            other => return Err(WireError::UnknownTag(other.to_string())),
        }
        expect_fields(TAG_CHUNK, &fields, 5)?;

        let start = number_field("range_start", fields[3])?;
        let end = number_field("range_end", fields[4])?;
        let range = ByteRange::new(start, end)?;
        check_payload_len(range, frame.len())?;

        Ok(Self {
            sender_id: number_field("sender_id", fields[1])?,
            filename: text_field("filename", fields[2])?,
            range,
            data: frame,
        })
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn check_text_field(field: &'static str, value: &str) -> Result<(), WireError> {
    if value.is_empty() {
        return Err(WireError::EmptyField(field));
    }
    if value.contains(FIELD_DELIMITER) {
        return Err(WireError::DelimiterInField(field));
    }
    Ok(())
}

fn check_payload_len(range: ByteRange, actual: usize) -> Result<(), WireError> {
    let actual = actual as u64;
    if actual != range.len() {
        return Err(WireError::PayloadLength {
            expected: range.len(),
            actual,
        });
    }
    Ok(())
}

fn expect_fields(tag: &'static str, fields: &[&str], expected: usize) -> Result<(), WireError> {
    if fields.len() != expected {
        return Err(WireError::FieldCount {
            tag,
            expected,
            actual: fields.len(),
        });
    }
    Ok(())
}

fn text_field(field: &'static str, value: &str) -> Result<String, WireError> {
    if value.is_empty() {
        return Err(WireError::EmptyField(field));
    }
    Ok(value.to_string())
}

fn number_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, WireError> {
    value.parse().map_err(|_| WireError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message tag: {0:?}")]
    UnknownTag(String),

    #[error("{0} message on the wrong channel")]
    UnexpectedTag(&'static str),

    #[error("{tag} expects {expected} fields, got {actual}")]
    FieldCount {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("field {field} is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),

    #[error("field {0} is empty")]
    EmptyField(&'static str),

    #[error("field {0} contains the ':' delimiter")]
    DelimiterInField(&'static str),

    #[error("range end {end} precedes start {start}")]
    InvertedRange { start: u64, end: u64 },

    #[error("payload is {actual} bytes, range needs {expected}")]
    PayloadLength { expected: u64, actual: u64 },

    #[error("chunk frame ends inside its header")]
    Truncated,

    #[error("chunk header of {0} bytes exceeds maximum {}", MAX_CHUNK_HEADER)]
    HeaderTooLong(usize),

    #[error("sender id {sender_id} overflows base port {base_port}")]
    PortOverflow { base_port: u16, sender_id: SenderId },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
