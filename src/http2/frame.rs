//! RFC 7540 frame layout (bit-exact): the 9-byte frame header plus the
//! frame type/flag vocabulary the session dispatches on.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    AltSvc,
    Origin,
    PriorityUpdate,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        use FrameType::*;
        Some(match b {
            0x0 => Data,
            0x1 => Headers,
            0x2 => Priority,
            0x3 => RstStream,
            0x4 => Settings,
            0x5 => PushPromise,
            0x6 => Ping,
            0x7 => Goaway,
            0x8 => WindowUpdate,
            0x9 => Continuation,
            0xa => AltSvc,
            0xc => Origin,
            0x10 => PriorityUpdate,
            _ => return None,
        })
    }

    fn to_byte(self) -> u8 {
        use FrameType::*;
        match self {
            Data => 0x0,
            Headers => 0x1,
            Priority => 0x2,
            RstStream => 0x3,
            Settings => 0x4,
            PushPromise => 0x5,
            Ping => 0x6,
            Goaway => 0x7,
            WindowUpdate => 0x8,
            Continuation => 0x9,
            AltSvc => 0xa,
            Origin => 0xc,
            PriorityUpdate => 0x10,
        }
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Parses a 9-byte frame header. Returns `None` for a reserved/unknown
/// frame type, which the session treats as an ignorable extension frame
/// per RFC 7540 §4.1.
pub fn parse_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = (buf[0] as u32) << 16 | (buf[1] as u32) << 8 | buf[2] as u32;
    let frame_type = FrameType::from_byte(buf[3])?;
    let flags = buf[4];
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    Some(FrameHeader {
        length,
        frame_type,
        flags,
        stream_id,
    })
}

pub fn write_header(out: &mut BytesMut, header: &FrameHeader) {
    out.put_u8((header.length >> 16) as u8);
    out.put_u8((header.length >> 8) as u8);
    out.put_u8(header.length as u8);
    out.put_u8(header.frame_type.to_byte());
    out.put_u8(header.flags);
    out.put_u32(header.stream_id & 0x7fff_ffff);
}

pub fn encode_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    write_header(
        &mut out,
        &FrameHeader {
            length: payload.len() as u32,
            frame_type,
            flags,
            stream_id,
        },
    );
    out.put_slice(payload);
    out.freeze()
}

/// Reads consecutive frames out of `input`, advancing it past whatever
/// was consumed. Stops at the first incomplete frame, leaving the
/// remainder in `input` for the next ingress call.
pub fn parse_frames(input: &mut Bytes) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        if input.len() < FRAME_HEADER_LEN {
            break;
        }
        let Some(header) = parse_header(&input[..FRAME_HEADER_LEN]) else {
            // Unknown frame type: skip header + payload if fully buffered.
            let total = FRAME_HEADER_LEN + peek_length(&input[..FRAME_HEADER_LEN]);
            if input.len() < total {
                break;
            }
            input.advance(total);
            continue;
        };
        let total = FRAME_HEADER_LEN + header.length as usize;
        if input.len() < total {
            break;
        }
        input.advance(FRAME_HEADER_LEN);
        let payload = input.split_to(header.length as usize);
        frames.push(Frame { header, payload });
    }
    frames
}

fn peek_length(buf: &[u8]) -> usize {
    ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode_and_parse() {
        let frame = encode_frame(FrameType::Headers, flags::END_HEADERS, 3, b"hello");
        let header = parse_header(&frame[..FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.stream_id, 3);
        assert!(matches!(header.frame_type, FrameType::Headers));
        assert_eq!(header.flags, flags::END_HEADERS);
    }

    #[test]
    fn parse_frames_stops_on_partial_frame() {
        let full = encode_frame(FrameType::Data, 0, 1, b"abc");
        let mut input = BytesMut::new();
        input.put_slice(&full[..full.len() - 1]);
        let mut bytes = input.freeze();
        let frames = parse_frames(&mut bytes);
        assert!(frames.is_empty());
        assert_eq!(bytes.len(), full.len() - 1);
    }

    #[test]
    fn parse_frames_extracts_multiple_frames_in_order() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode_frame(FrameType::Headers, flags::END_HEADERS, 1, b"h"));
        buf.put_slice(&encode_frame(FrameType::Data, flags::END_STREAM, 1, b"payload"));
        let mut bytes = buf.freeze();
        let frames = parse_frames(&mut bytes);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0].header.frame_type, FrameType::Headers));
        assert!(matches!(frames[1].header.frame_type, FrameType::Data));
        assert!(bytes.is_empty());
    }
}
