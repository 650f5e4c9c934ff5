//! Wire Frames
//!
//! Every frame starts with an 8-byte common header: frame length (i32),
//! version (u8), flags (u8) and frame type (u16). All fields are
//! little-endian. Frames in a term are aligned to [`FRAME_ALIGNMENT`].
//!
//! The sender emits setup frames and data frames (a zero-length data frame is
//! a heartbeat) and consumes status messages and NAKs from receivers.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Current protocol version.
pub const CURRENT_VERSION: u8 = 0;

/// Alignment of frames within a term.
pub const FRAME_ALIGNMENT: usize = 32;

/// Length of the common header shared by all frames.
pub const COMMON_HEADER_LENGTH: usize = 8;

/// Length of a data (and heartbeat) frame header.
pub const DATA_HEADER_LENGTH: usize = 32;

/// Length of a setup frame.
pub const SETUP_HEADER_LENGTH: usize = 40;

/// Length of a status message frame.
pub const STATUS_MESSAGE_LENGTH: usize = 28;

/// Length of a NAK frame.
pub const NAK_HEADER_LENGTH: usize = 28;

/// Begin-of-message flag on data frames.
pub const BEGIN_FLAG: u8 = 0x80;

/// End-of-message flag on data frames.
pub const END_FLAG: u8 = 0x40;

/// Both message boundary flags, used for unfragmented messages and heartbeats.
pub const BEGIN_AND_END_FLAGS: u8 = BEGIN_FLAG | END_FLAG;

/// Status message flag asking the sender to emit a setup frame.
pub const SEND_SETUP_FLAG: u8 = 0x80;

// Common header field offsets
pub const FRAME_LENGTH_FIELD_OFFSET: usize = 0;
pub const VERSION_FIELD_OFFSET: usize = 4;
pub const FLAGS_FIELD_OFFSET: usize = 5;
pub const TYPE_FIELD_OFFSET: usize = 6;

// Data and setup header field offsets
pub const TERM_OFFSET_FIELD_OFFSET: usize = 8;
pub const SESSION_ID_FIELD_OFFSET: usize = 12;
pub const STREAM_ID_FIELD_OFFSET: usize = 16;
pub const TERM_ID_FIELD_OFFSET: usize = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: usize = 24;

// Setup-only field offsets
pub const INITIAL_TERM_ID_FIELD_OFFSET: usize = 20;
pub const ACTIVE_TERM_ID_FIELD_OFFSET: usize = 24;
pub const TERM_LENGTH_FIELD_OFFSET: usize = 28;
pub const MTU_LENGTH_FIELD_OFFSET: usize = 32;
pub const TTL_FIELD_OFFSET: usize = 36;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// Filler at the end of a term
    Padding = 0,
    /// Application data, or a heartbeat when empty
    Data = 1,
    /// Negative acknowledgement
    Nak = 2,
    /// Receiver status message
    StatusMessage = 3,
    /// Error report
    Error = 4,
    /// Stream setup announcement
    Setup = 5,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(FrameType::Padding),
            1 => Some(FrameType::Data),
            2 => Some(FrameType::Nak),
            3 => Some(FrameType::StatusMessage),
            4 => Some(FrameType::Error),
            5 => Some(FrameType::Setup),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Frame decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Wrong frame type: expected {expected:?}, got {actual}")]
    WrongFrameType { expected: FrameType, actual: u16 },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),
}

/// Common header present at the start of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
}

impl FrameHeader {
    /// Peek at the common header of a received datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        check_length(bytes, COMMON_HEADER_LENGTH)?;

        let mut buf = &bytes[..COMMON_HEADER_LENGTH];
        Ok(FrameHeader {
            frame_length: buf.get_i32_le(),
            version: buf.get_u8(),
            flags: buf.get_u8(),
            frame_type: buf.get_u16_le(),
        })
    }

    /// Decoded frame type, if known.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u16(self.frame_type)
    }

    fn to_bytes(self, buf: &mut BytesMut) {
        buf.put_i32_le(self.frame_length);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.frame_type);
    }

    fn expect(bytes: &[u8], expected: FrameType, length: usize) -> Result<Self, FrameError> {
        check_length(bytes, length)?;
        let header = FrameHeader::from_bytes(bytes)?;
        if header.version != CURRENT_VERSION {
            return Err(FrameError::UnsupportedVersion(header.version));
        }
        if header.frame_type != expected.as_u16() {
            return Err(FrameError::WrongFrameType {
                expected,
                actual: header.frame_type,
            });
        }
        Ok(header)
    }
}

fn check_length(bytes: &[u8], expected: usize) -> Result<(), FrameError> {
    if bytes.len() < expected {
        return Err(FrameError::InsufficientData {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Setup frame announcing stream parameters to receivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupHeader {
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_length: i32,
    pub mtu_length: i32,
    pub ttl: i32,
}

impl SetupHeader {
    /// Serialize the complete setup frame
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        FrameHeader {
            frame_length: SETUP_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: FrameType::Setup.as_u16(),
        }
        .to_bytes(buf);
        buf.put_i32_le(self.term_offset);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.initial_term_id);
        buf.put_i32_le(self.active_term_id);
        buf.put_i32_le(self.term_length);
        buf.put_i32_le(self.mtu_length);
        buf.put_i32_le(self.ttl);
    }

    /// Parse a setup frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameHeader::expect(bytes, FrameType::Setup, SETUP_HEADER_LENGTH)?;

        let mut buf = &bytes[TERM_OFFSET_FIELD_OFFSET..SETUP_HEADER_LENGTH];
        Ok(SetupHeader {
            term_offset: buf.get_i32_le(),
            session_id: buf.get_i32_le(),
            stream_id: buf.get_i32_le(),
            initial_term_id: buf.get_i32_le(),
            active_term_id: buf.get_i32_le(),
            term_length: buf.get_i32_le(),
            mtu_length: buf.get_i32_le(),
            ttl: buf.get_i32_le(),
        })
    }
}

/// Data frame header; also used for heartbeats and padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub flags: u8,
    pub frame_type: FrameType,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl DataHeader {
    /// Serialize the header
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        FrameHeader {
            frame_length: self.frame_length,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: self.frame_type.as_u16(),
        }
        .to_bytes(buf);
        buf.put_i32_le(self.term_offset);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.term_id);
        buf.put_i64_le(self.reserved_value);
    }

    /// Parse a data or padding header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        check_length(bytes, DATA_HEADER_LENGTH)?;
        let header = FrameHeader::from_bytes(bytes)?;
        let frame_type = match header.frame_type() {
            Some(t @ (FrameType::Data | FrameType::Padding)) => t,
            _ => {
                return Err(FrameError::WrongFrameType {
                    expected: FrameType::Data,
                    actual: header.frame_type,
                })
            }
        };

        let mut buf = &bytes[TERM_OFFSET_FIELD_OFFSET..DATA_HEADER_LENGTH];
        Ok(DataHeader {
            frame_length: header.frame_length,
            flags: header.flags,
            frame_type,
            term_offset: buf.get_i32_le(),
            session_id: buf.get_i32_le(),
            stream_id: buf.get_i32_le(),
            term_id: buf.get_i32_le(),
            reserved_value: buf.get_i64_le(),
        })
    }

    /// Whether this is a zero-length liveness frame.
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Data && self.frame_length == 0
    }
}

/// Receiver status message: consumption position and available window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessageFrame {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window_length: i32,
}

impl StatusMessageFrame {
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        FrameHeader {
            frame_length: STATUS_MESSAGE_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: FrameType::StatusMessage.as_u16(),
        }
        .to_bytes(buf);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.consumption_term_id);
        buf.put_i32_le(self.consumption_term_offset);
        buf.put_i32_le(self.receiver_window_length);
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::expect(bytes, FrameType::StatusMessage, STATUS_MESSAGE_LENGTH)?;

        let mut buf = &bytes[COMMON_HEADER_LENGTH..STATUS_MESSAGE_LENGTH];
        Ok(StatusMessageFrame {
            flags: header.flags,
            session_id: buf.get_i32_le(),
            stream_id: buf.get_i32_le(),
            consumption_term_id: buf.get_i32_le(),
            consumption_term_offset: buf.get_i32_le(),
            receiver_window_length: buf.get_i32_le(),
        })
    }

    /// Whether the receiver is asking for a setup frame.
    pub fn wants_setup(&self) -> bool {
        self.flags & SEND_SETUP_FLAG != 0
    }
}

/// Negative acknowledgement requesting retransmission of a byte range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakFrame {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl NakFrame {
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        FrameHeader {
            frame_length: NAK_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: FrameType::Nak.as_u16(),
        }
        .to_bytes(buf);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.term_id);
        buf.put_i32_le(self.term_offset);
        buf.put_i32_le(self.length);
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameHeader::expect(bytes, FrameType::Nak, NAK_HEADER_LENGTH)?;

        let mut buf = &bytes[COMMON_HEADER_LENGTH..NAK_HEADER_LENGTH];
        Ok(NakFrame {
            session_id: buf.get_i32_le(),
            stream_id: buf.get_i32_le(),
            term_id: buf.get_i32_le(),
            term_offset: buf.get_i32_le(),
            length: buf.get_i32_le(),
        })
    }
}

/// Pre-built setup frame; only the active term id and term offset change
/// between sends.
pub struct SetupFrameTemplate {
    buf: BytesMut,
}

impl SetupFrameTemplate {
    pub fn new(header: &SetupHeader) -> Self {
        let mut buf = BytesMut::with_capacity(SETUP_HEADER_LENGTH);
        header.to_bytes(&mut buf);
        SetupFrameTemplate { buf }
    }

    /// Patch the mutable fields and return the frame to send.
    pub fn patch(&mut self, active_term_id: i32, term_offset: i32) -> &[u8] {
        (&mut self.buf[ACTIVE_TERM_ID_FIELD_OFFSET..]).put_i32_le(active_term_id);
        (&mut self.buf[TERM_OFFSET_FIELD_OFFSET..]).put_i32_le(term_offset);
        &self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Pre-built heartbeat frame: a zero-length data frame carrying the current
/// term id and offset.
pub struct HeartbeatFrameTemplate {
    buf: BytesMut,
}

impl HeartbeatFrameTemplate {
    pub fn new(session_id: i32, stream_id: i32) -> Self {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LENGTH);
        DataHeader {
            frame_length: 0,
            flags: BEGIN_AND_END_FLAGS,
            frame_type: FrameType::Data,
            term_offset: 0,
            session_id,
            stream_id,
            term_id: 0,
            reserved_value: 0,
        }
        .to_bytes(&mut buf);
        HeartbeatFrameTemplate { buf }
    }

    /// Patch the mutable fields and return the frame to send.
    pub fn patch(&mut self, term_id: i32, term_offset: i32) -> &[u8] {
        (&mut self.buf[TERM_ID_FIELD_OFFSET..]).put_i32_le(term_id);
        (&mut self.buf[TERM_OFFSET_FIELD_OFFSET..]).put_i32_le(term_offset);
        &self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_header() -> SetupHeader {
        SetupHeader {
            term_offset: 0,
            session_id: 0x0102_0304,
            stream_id: 10,
            initial_term_id: 5,
            active_term_id: 5,
            term_length: 65536,
            mtu_length: 1408,
            ttl: 0,
        }
    }

    #[test]
    fn test_frame_type() {
        assert_eq!(FrameType::from_u16(5), Some(FrameType::Setup));
        assert_eq!(FrameType::from_u16(9), None);
        assert_eq!(FrameType::StatusMessage.as_u16(), 3);
    }

    #[test]
    fn test_setup_frame_layout() {
        let mut buf = BytesMut::new();
        setup_header().to_bytes(&mut buf);

        assert_eq!(buf.len(), SETUP_HEADER_LENGTH);
        assert_eq!(&buf[0..4], &40_i32.to_le_bytes());
        assert_eq!(buf[4], CURRENT_VERSION);
        assert_eq!(buf[5], 0);
        assert_eq!(&buf[6..8], &5_u16.to_le_bytes());
        assert_eq!(&buf[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[28..32], &65536_i32.to_le_bytes());
        assert_eq!(&buf[32..36], &1408_i32.to_le_bytes());
    }

    #[test]
    fn test_setup_template_patch() {
        let mut template = SetupFrameTemplate::new(&setup_header());
        let frame = template.patch(7, 4096).to_vec();

        let decoded = SetupHeader::from_bytes(&frame).unwrap();
        assert_eq!(decoded.active_term_id, 7);
        assert_eq!(decoded.term_offset, 4096);
        assert_eq!(decoded.initial_term_id, 5);
    }

    #[test]
    fn test_heartbeat_template() {
        let mut template = HeartbeatFrameTemplate::new(1, 2);
        let frame = template.patch(3, 4096).to_vec();

        assert_eq!(frame.len(), DATA_HEADER_LENGTH);
        let header = DataHeader::from_bytes(&frame).unwrap();
        assert!(header.is_heartbeat());
        assert_eq!(header.flags, BEGIN_AND_END_FLAGS);
        assert_eq!(header.term_id, 3);
        assert_eq!(header.term_offset, 4096);
    }

    #[test]
    fn test_status_message_decode() {
        let mut buf = BytesMut::new();
        StatusMessageFrame {
            flags: SEND_SETUP_FLAG,
            session_id: 1,
            stream_id: 2,
            consumption_term_id: 3,
            consumption_term_offset: 64,
            receiver_window_length: 65536,
        }
        .to_bytes(&mut buf);

        assert_eq!(buf.len(), STATUS_MESSAGE_LENGTH);
        let sm = StatusMessageFrame::from_bytes(&buf).unwrap();
        assert!(sm.wants_setup());
        assert_eq!(sm.receiver_window_length, 65536);
    }

    #[test]
    fn test_wrong_frame_type() {
        let mut buf = BytesMut::new();
        NakFrame {
            session_id: 1,
            stream_id: 2,
            term_id: 3,
            term_offset: 0,
            length: 1408,
        }
        .to_bytes(&mut buf);

        assert_eq!(
            StatusMessageFrame::from_bytes(&buf),
            Err(FrameError::WrongFrameType {
                expected: FrameType::StatusMessage,
                actual: FrameType::Nak.as_u16(),
            })
        );
        assert!(NakFrame::from_bytes(&buf).is_ok());
    }

    #[test]
    fn test_short_frame() {
        let err = NakFrame::from_bytes(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            FrameError::InsufficientData {
                expected: NAK_HEADER_LENGTH,
                actual: 10
            }
        );
    }
}
