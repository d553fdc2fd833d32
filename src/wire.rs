//! Frame header layout and the message catalog (spec §4.1, §6).
//!
//! `[u16 length BE][u32 ref BE][u16 code BE][payload]`. `length` counts the
//! 6 bytes of ref+code plus the payload. The low two bits of `code` are a
//! flag (`Flag`); the remaining bits are the message type id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of bytes in a frame header after the `length` prefix itself.
const HEADER_LEN: usize = 6;

/// The low two bits of a frame's `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Flag {
    /// A request, sent by the client.
    Req = 0,
    /// A confirmation, sent by the daemon in reply to a request.
    Cnf = 1,
    /// An indication, sent by the daemon without a matching request.
    Ind = 2,
    /// Reserved direction, present in the code table but unused by the
    /// core client surface (spec §6 only documents REQ/CNF/IND traffic).
    Rsp = 3,
}

/// The message type table from spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    /// `Error` — CNF-only.
    Error = 0x000,
    /// `Init` — REQ/CNF.
    Init = 0x001,
    /// `Enum` — REQ/CNF.
    Enum = 0x002,
    /// `LookupDoc` — REQ/CNF.
    LookupDoc = 0x003,
    /// `Stat` — REQ/CNF.
    Stat = 0x005,
    /// `Peek` — REQ/CNF.
    Peek = 0x006,
    /// `Update` — REQ/CNF.
    Update = 0x009,
    /// `Resume` — REQ/CNF.
    Resume = 0x00a,
    /// `Read` — REQ/CNF.
    Read = 0x00b,
    /// `Trunc` — REQ/CNF.
    Trunc = 0x00c,
    /// `WriteBuffer` — REQ/CNF.
    WriteBuffer = 0x00d,
    /// `WriteCommit` — REQ/CNF.
    WriteCommit = 0x00e,
    /// `GetType` — REQ/CNF.
    GetType = 0x011,
    /// `Commit` — REQ/CNF.
    Commit = 0x016,
    /// `Suspend` — REQ/CNF.
    Suspend = 0x017,
    /// `Close` — REQ/CNF.
    Close = 0x018,
    /// `WatchAdd` — REQ/CNF.
    WatchAdd = 0x019,
    /// `WatchRem` — REQ/CNF.
    WatchRem = 0x01a,
    /// `WatchProgress` — REQ/CNF.
    WatchProgress = 0x01b,
    /// `ReplicateDoc` — REQ/CNF.
    ReplicateDoc = 0x020,
    /// `Mount` — REQ/CNF.
    Mount = 0x022,
    /// `Unmount` — REQ/CNF.
    Unmount = 0x023,
    /// `GetPath` — REQ/CNF.
    GetPath = 0x024,
    /// `Watch` — IND only.
    Watch = 0x025,
    /// `ProgressStart` — REQ/IND.
    ProgressStart = 0x026,
    /// `Progress` — IND only.
    Progress = 0x027,
    /// `ProgressEnd` — REQ/IND.
    ProgressEnd = 0x028,
    /// `ProgressQuery` — REQ/CNF.
    ProgressQuery = 0x029,
    /// `WalkPath` — REQ/CNF.
    WalkPath = 0x02a,
    /// `GetData` — REQ/CNF.
    GetData = 0x02b,
    /// `SetData` — REQ/CNF.
    SetData = 0x02c,
    /// `GetLinks` — REQ/CNF.
    GetLinks = 0x02d,
}

/// Error decoding a frame header or body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer did not contain a complete frame.
    #[error("truncated frame")]
    Truncated,
    /// The code's message-type bits did not match any known [`MessageType`].
    #[error("unknown message type: {0:#x}")]
    UnknownMessageType(u16),
}

/// A decoded frame header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Caller-assigned correlation id, echoed by the matching CNF.
    pub reference: u32,
    /// REQ / CNF / IND / RSP.
    pub flag: Flag,
    /// Which RPC or indication this frame carries.
    pub message_type: MessageType,
    /// The message body, opaque to this layer.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame to send, given a correlation ref.
    pub fn request(reference: u32, message_type: MessageType, payload: Bytes) -> Self {
        Frame { reference, flag: Flag::Req, message_type, payload }
    }

    fn code(&self) -> u16 {
        (u16::from(self.message_type) << 2) | u16::from(self.flag)
    }

    /// Serialize to the on-wire form, including the leading length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + HEADER_LEN + self.payload.len());
        let length = (HEADER_LEN + self.payload.len()) as u16;
        buf.put_u16(length);
        buf.put_u32(self.reference);
        buf.put_u16(self.code());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a single frame from `data`, which must contain the length
    /// prefix and the full frame it describes (no extra trailing bytes are
    /// assumed or rejected; callers doing stream framing slice `data` to
    /// exactly `2 + length` bytes first).
    pub fn decode(mut data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < 2 {
            return Err(FrameError::Truncated);
        }
        let length = data.get_u16() as usize;
        if data.len() < length {
            return Err(FrameError::Truncated);
        }
        if length < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let reference = data.get_u32();
        let code = data.get_u16();
        let flag = Flag::try_from(code & 0b11).expect("2-bit mask always valid");
        let type_id = code >> 2;
        let message_type = MessageType::try_from(type_id)
            .map_err(|_| FrameError::UnknownMessageType(type_id))?;
        let payload_len = length - HEADER_LEN;
        let payload = Bytes::copy_from_slice(&data[..payload_len]);
        Ok(Frame { reference, flag, message_type, payload })
    }

    /// Read the `length` prefix of a frame sitting at the start of `data`,
    /// if enough bytes are present to know it. Used by the transport's
    /// stream reader to know how many more bytes to buffer before calling
    /// [`Frame::decode`].
    pub fn peek_total_len(data: &[u8]) -> Option<usize> {
        if data.len() < 2 {
            return None;
        }
        let length = u16::from_be_bytes([data[0], data[1]]) as usize;
        Some(2 + length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_payload() {
        let payload = Bytes::from_static(b"hello");
        let frame = Frame::request(7, MessageType::Init, payload.clone());
        let encoded = frame.encode();
        assert_eq!(Frame::peek_total_len(&encoded), Some(encoded.len()));
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.reference, 7);
        assert_eq!(decoded.flag, Flag::Req);
        assert_eq!(decoded.message_type, MessageType::Init);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn flag_is_low_two_bits() {
        let frame = Frame { reference: 1, flag: Flag::Cnf, message_type: MessageType::Read, payload: Bytes::new() };
        assert_eq!(frame.code() & 0b11, u16::from(Flag::Cnf));
        assert_eq!(frame.code() >> 2, u16::from(MessageType::Read));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert_eq!(Frame::decode(&[0, 1]), Err(FrameError::Truncated));
        assert_eq!(Frame::decode(&[]), Err(FrameError::Truncated));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(HEADER_LEN as u16);
        buf.put_u32(1);
        buf.put_u16(0xFFF << 2);
        assert_eq!(
            Frame::decode(&buf),
            Err(FrameError::UnknownMessageType(0xFFF))
        );
    }
}
