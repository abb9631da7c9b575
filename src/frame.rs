use crate::{flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};

/// The fixed 9-byte prefix of every HTTP/2 frame.
///
/// ```text
/// length   : u24 big-endian
/// type     : u8
/// flags    : u8
/// streamId : u32 big-endian, top bit reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub typ: u8,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub const SIZE: usize = 9;

    /// Parse from a buffer holding at least [`Self::SIZE`] bytes. The reserved
    /// top bit of the stream id is masked off.
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            length: u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]),
            typ: buf[3],
            flags: buf[4],
            // unwrap: the length of the slice is always 4
            stream_id: u32::from_be_bytes(buf[5..9].try_into().unwrap()) & U31_MAX.get(),
        }
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE + self.length as usize);
        dst.put_uint(u64::from(self.length), 3);
        dst.put_u8(self.typ);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & U31_MAX.get());
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.typ)
    }
}

/// Pull decoder over an input buffer fed by the socket reader.
///
/// Each call either produces a complete frame, asks for more bytes (`None`),
/// or rejects an oversized frame before its payload is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn decode(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(FrameHeader, Bytes)>, FrameDecodeError> {
        if buf.len() < FrameHeader::SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&buf[..FrameHeader::SIZE]);
        if header.length > self.max_frame_size {
            return Err(FrameDecodeError::Oversized {
                length: header.length,
                max: self.max_frame_size,
            });
        }
        if buf.len() < FrameHeader::SIZE + header.length as usize {
            return Ok(None);
        }
        buf.advance(FrameHeader::SIZE);
        let payload = buf.split_to(header.length as usize).freeze();
        Ok(Some((header, payload)))
    }
}

/// Append one complete frame (header plus payload) to `dst`.
pub fn encode_frame(
    dst: &mut BytesMut,
    typ: FrameType,
    flags: u8,
    stream_id: StreamId,
    payload: &[u8],
) {
    FrameHeader {
        length: payload.len() as u32,
        // unwrap: FrameType is repr(u8)
        typ: typ.to_u8().unwrap(),
        flags,
        stream_id,
    }
    .encode_into(dst);
    dst.put_slice(payload);
}

/// Serialize SETTINGS parameters as 6-byte (u16 id, u32 value) entries.
pub fn settings_payload(params: &[(SettingsParameter, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6 * params.len());
    for &(key, value) in params {
        payload.extend((key as u16).to_be_bytes());
        payload.extend(value.to_be_bytes());
    }
    payload
}

/// Split a SETTINGS payload into raw (id, value) entries. The caller decides
/// which ids it understands; the length must already be a multiple of 6.
pub fn parse_settings_payload(payload: &[u8]) -> Vec<(u16, u32)> {
    payload
        .chunks_exact(6)
        .map(|chunk| {
            (
                // unwrap: chunks_exact guarantees the slice lengths
                u16::from_be_bytes(chunk[0..2].try_into().unwrap()),
                u32::from_be_bytes(chunk[2..6].try_into().unwrap()),
            )
        })
        .collect()
}

pub fn settings_ack(dst: &mut BytesMut) {
    encode_frame(dst, FrameType::Settings, SettingsFlags::ACK.bits(), 0, &[]);
}

pub fn ping_ack(dst: &mut BytesMut, data: &[u8]) {
    encode_frame(dst, FrameType::Ping, PingFlags::ACK.bits(), 0, data);
}

pub fn window_update(dst: &mut BytesMut, stream_id: StreamId, increment: u32) {
    encode_frame(
        dst,
        FrameType::WindowUpdate,
        0,
        stream_id,
        &(increment & U31_MAX.get()).to_be_bytes(),
    );
}

pub fn rst_stream(dst: &mut BytesMut, stream_id: StreamId, error: ErrorType) {
    encode_frame(
        dst,
        FrameType::ResetStream,
        0,
        stream_id,
        // unwrap: ErrorType is repr(u32)
        &error.to_u32().unwrap().to_be_bytes(),
    );
}

pub fn goaway(dst: &mut BytesMut, last_stream_id: StreamId, error: ErrorType, debug: &[u8]) {
    let mut payload = Vec::with_capacity(8 + debug.len());
    payload.extend((last_stream_id & U31_MAX.get()).to_be_bytes());
    // unwrap: ErrorType is repr(u32)
    payload.extend(error.to_u32().unwrap().to_be_bytes());
    payload.extend_from_slice(debug);
    encode_frame(dst, FrameType::GoAway, 0, 0, &payload);
}

/// Emit a header block as one HEADERS frame plus as many CONTINUATION frames
/// as the peer's max frame size requires. END_HEADERS goes on the last frame
/// only; END_STREAM (if requested) on the initial HEADERS frame only.
pub fn encode_header_block(
    dst: &mut BytesMut,
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    let mut chunks = block.chunks(max_frame_size.max(1));
    let total = chunks.len().max(1);
    let first = chunks.next().unwrap_or(&[]);

    let mut flags = HeadersFlags::empty();
    if end_stream {
        flags |= HeadersFlags::END_STREAM;
    }
    if total == 1 {
        flags |= HeadersFlags::END_HEADERS;
    }
    encode_frame(dst, FrameType::Headers, flags.bits(), stream_id, first);

    for (index, chunk) in chunks.enumerate() {
        let flags = if index + 2 == total {
            ContinuationFlags::END_HEADERS.bits()
        } else {
            0
        };
        encode_frame(dst, FrameType::Continuation, flags, stream_id, chunk);
    }
}
