//! A scripted HTTP/2 server driving the peer end of an in-memory pipe.
//!
//! Frames are built and parsed at the raw byte level on purpose, so the
//! client under test is checked against the wire format rather than against
//! its own codec.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_PUSH_PROMISE: u8 = 0x5;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;

#[derive(Debug)]
pub struct RawFrame {
    pub typ: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub struct TestPeer {
    stream: DuplexStream,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl TestPeer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    async fn read_exact(&mut self, length: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; length];
        self.stream.read_exact(&mut buf).await.expect("peer read");
        buf
    }

    pub async fn read_frame(&mut self) -> RawFrame {
        let header = self.read_exact(9).await;
        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & (u32::MAX >> 1);
        RawFrame {
            typ: header[3],
            flags: header[4],
            stream_id,
            payload: self.read_exact(length).await,
        }
    }

    /// Next frame that is not flow-control bookkeeping.
    pub async fn read_non_flow_frame(&mut self) -> RawFrame {
        loop {
            let frame = self.read_frame().await;
            if frame.typ != TYPE_WINDOW_UPDATE {
                return frame;
            }
        }
    }

    pub async fn write_frame(&mut self, typ: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(9 + payload.len());
        buf.put_uint(payload.len() as u64, 3);
        buf.put_u8(typ);
        buf.put_u8(flags);
        buf.put_u32(stream_id);
        buf.put_slice(payload);
        self.stream.write_all(&buf).await.expect("peer write");
    }

    /// Consume the client preface and SETTINGS, answer with our own SETTINGS
    /// (plus an ACK of theirs), and eat the client's ACK.
    pub async fn handshake(&mut self, settings: &[(u16, u32)]) {
        let preface = self.read_exact(PREFACE.len()).await;
        assert_eq!(preface, PREFACE, "client preface");

        let client_settings = self.read_frame().await;
        assert_eq!(client_settings.typ, TYPE_SETTINGS, "client SETTINGS");
        assert_eq!(client_settings.flags, 0);

        let mut payload = Vec::with_capacity(6 * settings.len());
        for &(id, value) in settings {
            payload.extend(id.to_be_bytes());
            payload.extend(value.to_be_bytes());
        }
        self.write_frame(TYPE_SETTINGS, 0, 0, &payload).await;
        self.write_frame(TYPE_SETTINGS, FLAG_ACK, 0, &[]).await;

        let ack = self.read_frame().await;
        assert_eq!((ack.typ, ack.flags), (TYPE_SETTINGS, FLAG_ACK), "client SETTINGS ACK");
    }

    /// Read a full request header block (HEADERS plus CONTINUATION frames)
    /// and decode it. Returns the stream id, the initial HEADERS flags, the
    /// number of frames the block spanned, and the decoded headers.
    pub async fn read_header_block(&mut self) -> (u32, u8, usize, Vec<(String, String)>) {
        let first = self.read_non_flow_frame().await;
        assert_eq!(first.typ, TYPE_HEADERS, "expected HEADERS");
        let mut block = first.payload.clone();
        let mut frames = 1;
        let mut end_headers = first.flags & FLAG_END_HEADERS != 0;
        while !end_headers {
            let cont = self.read_frame().await;
            assert_eq!(cont.typ, TYPE_CONTINUATION, "expected CONTINUATION");
            assert_eq!(cont.stream_id, first.stream_id);
            block.extend_from_slice(&cont.payload);
            end_headers = cont.flags & FLAG_END_HEADERS != 0;
            frames += 1;
        }
        let headers = self
            .decoder
            .decode(&block)
            .expect("hpack decode")
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8(name).expect("header name"),
                    String::from_utf8(value).expect("header value"),
                )
            })
            .collect();
        (first.stream_id, first.flags, frames, headers)
    }

    pub async fn send_headers(&mut self, stream_id: u32, headers: &[(&str, &str)], end_stream: bool) {
        let block = self
            .encoder
            .encode(headers.iter().map(|&(name, value)| (name.as_bytes(), value.as_bytes())));
        let flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame(TYPE_HEADERS, flags, stream_id, &block).await;
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.write_frame(TYPE_DATA, flags, stream_id, data).await;
    }

    pub async fn send_rst(&mut self, stream_id: u32, code: u32) {
        self.write_frame(TYPE_RST_STREAM, 0, stream_id, &code.to_be_bytes())
            .await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: u32, code: u32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend(last_stream_id.to_be_bytes());
        payload.extend(code.to_be_bytes());
        self.write_frame(TYPE_GOAWAY, 0, 0, &payload).await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.write_frame(TYPE_WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await;
    }

    pub async fn expect_data(&mut self, stream_id: u32) -> (Vec<u8>, bool) {
        let frame = self.read_non_flow_frame().await;
        assert_eq!(frame.typ, TYPE_DATA, "expected DATA");
        assert_eq!(frame.stream_id, stream_id);
        let end_stream = frame.flags & FLAG_END_STREAM != 0;
        (frame.payload, end_stream)
    }

    pub async fn expect_rst(&mut self, stream_id: u32) -> u32 {
        let frame = self.read_non_flow_frame().await;
        assert_eq!(frame.typ, TYPE_RST_STREAM, "expected RST_STREAM");
        assert_eq!(frame.stream_id, stream_id);
        u32::from_be_bytes(frame.payload[0..4].try_into().expect("error code"))
    }

    /// Skip anything else the client flushes and return the GOAWAY error code.
    pub async fn expect_goaway(&mut self) -> u32 {
        loop {
            let frame = self.read_frame().await;
            if frame.typ == TYPE_GOAWAY {
                return u32::from_be_bytes(frame.payload[4..8].try_into().expect("error code"));
            }
        }
    }

    /// Next WINDOW_UPDATE, as (stream id, increment).
    pub async fn expect_window_update(&mut self) -> (u32, u32) {
        loop {
            let frame = self.read_frame().await;
            if frame.typ == TYPE_WINDOW_UPDATE {
                let increment =
                    u32::from_be_bytes(frame.payload[0..4].try_into().expect("increment"));
                return (frame.stream_id, increment);
            }
        }
    }
}
