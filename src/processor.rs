//! Inbound frame dispatch and protocol validation.
//!
//! The processor is purely a state mutation over [`ConnectionInner`]: the
//! reader task feeds it complete frames and afterwards writes whatever
//! administrative frames it queued in the [`Outbox`]. Faults come back as
//! [`H2Error`] with connection or stream severity; the reader turns those
//! into GOAWAY or RST_STREAM respectively.

use crate::{
    connection::ConnectionInner,
    flags::*,
    flow, frame,
    frame::FrameHeader,
    response::{Body, Response},
    stream::StreamState,
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use num_traits::FromPrimitive;

/// Frames and follow-up work produced while handling one inbound frame.
#[derive(Default)]
pub struct Outbox {
    /// Encoded administrative frames (ACKs, WINDOW_UPDATE, PING response).
    pub frames: BytesMut,
    /// New send credit arrived; a buffered-send pass must run on a later tick.
    pub schedule_drain: bool,
    /// First SETTINGS processed; signal waiting requests once the ACK is on
    /// the wire, so no request's HEADERS can overtake it.
    pub settings_ready: bool,
    /// The peer ended the connection (GOAWAY); tear down after flushing.
    pub close: Option<Error>,
}

pub fn handle_frame(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    let Some(typ) = header.frame_type() else {
        // Unknown frame types are consumed and discarded (RFC 7540 §4.1).
        trace!("discarding unknown frame type {:#x}", header.typ);
        return Ok(());
    };

    // While a header block is open, only CONTINUATION on the same stream is
    // legal; anything else poisons the connection.
    if let Some(expected) = inner.continuation {
        if typ != FrameType::Continuation || header.stream_id != expected.get() {
            return Err(H2Error::conn(
                ErrorType::ProtocolError,
                "expected a CONTINUATION frame for the open header block",
            ));
        }
    }
    if header.stream_id != 0 {
        inner.last_remote_id = inner.last_remote_id.max(header.stream_id);
    }

    match typ {
        FrameType::Data => on_data(inner, header, payload, out),
        FrameType::Headers => on_headers(inner, header, payload),
        FrameType::Priority => on_priority(inner, header, payload),
        FrameType::ResetStream => on_rst_stream(inner, header, payload),
        FrameType::Settings => on_settings(inner, header, payload, out),
        FrameType::PushPromise => Err(H2Error::conn(
            ErrorType::ProtocolError,
            "PUSH_PROMISE received although push is disabled",
        )),
        FrameType::Ping => on_ping(header, payload, out),
        FrameType::GoAway => on_goaway(inner, header, payload, out),
        FrameType::WindowUpdate => on_window_update(inner, header, payload, out),
        FrameType::Continuation => on_continuation(inner, header, payload),
    }
}

fn require_stream_id(header: FrameHeader, what: &str) -> Result<NonZeroStreamId, H2Error> {
    NonZeroStreamId::new(header.stream_id).ok_or_else(|| {
        H2Error::conn(ErrorType::ProtocolError, format!("{what} frame on stream 0"))
    })
}

/// Remove the optional pad-length prefix and trailing padding.
fn strip_padding(payload: &Bytes, padded: bool) -> Result<Bytes, H2Error> {
    if !padded {
        return Ok(payload.clone());
    }
    let pad = payload.first().copied().ok_or_else(|| {
        H2Error::conn(ErrorType::ProtocolError, "padded frame without a pad length")
    })? as usize;
    if pad + 1 > payload.len() {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "padding exceeds the frame length",
        ));
    }
    Ok(payload.slice(1..payload.len() - pad))
}

fn on_data(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    let id = require_stream_id(header, "DATA")?;
    let flags = DataFlags::from_bits_truncate(header.flags);
    let end_stream = flags.contains(DataFlags::END_STREAM);
    let data = strip_padding(payload, flags.contains(DataFlags::PADDED))?;

    // Padding still consumes flow-control credit.
    inner.recv_window -= i64::from(header.length);

    let release = {
        let stream = inner.streams.get_mut(id).ok_or_else(|| {
            H2Error::conn(
                ErrorType::ProtocolError,
                format!("DATA on unknown stream {id}"),
            )
        })?;
        if stream.state.contains(StreamState::REMOTE_CLOSED) {
            return Err(H2Error::stream(
                id,
                ErrorType::StreamClosed,
                "DATA on a half-closed stream",
            ));
        }
        if !stream.state.contains(StreamState::RESERVED) {
            return Err(H2Error::stream(
                id,
                ErrorType::ProtocolError,
                "DATA before the response head",
            ));
        }
        stream.recv_window -= i64::from(header.length);
        stream.received += data.len() as u64;
        if let Some(expected) = stream.expected_length {
            if stream.received > expected {
                return Err(H2Error::stream(
                    id,
                    ErrorType::ProtocolError,
                    "body exceeds the declared content-length",
                ));
            }
        }
        if stream.received > stream.max_body_size as u64 && !end_stream {
            return Err(H2Error::stream(
                id,
                ErrorType::Cancel,
                "body exceeds the per-request size limit",
            ));
        }
        if !data.is_empty() {
            stream.push_body_chunk(data);
        }
        if end_stream {
            stream.state.insert(StreamState::REMOTE_CLOSED);
            if let Some(expected) = stream.expected_length {
                if stream.received != expected {
                    return Err(H2Error::stream(
                        id,
                        ErrorType::ProtocolError,
                        "body shorter than the declared content-length",
                    ));
                }
            }
            true
        } else {
            if let Some(increment) = flow::stream_replenish(stream) {
                stream.recv_window += i64::from(increment);
                frame::window_update(&mut out.frames, id.get(), increment);
            }
            false
        }
    };
    if release {
        inner.release_ok(id);
    }

    let watermark = inner.streams.largest_max_body() as i64;
    if let Some(increment) = flow::connection_replenish(inner.recv_window, watermark) {
        inner.recv_window += i64::from(increment);
        frame::window_update(&mut out.frames, 0, increment);
    }
    Ok(())
}

fn on_headers(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
) -> Result<(), H2Error> {
    let id = require_stream_id(header, "HEADERS")?;
    let flags = HeadersFlags::from_bits_truncate(header.flags);
    let end_headers = flags.contains(HeadersFlags::END_HEADERS);
    let mut block = strip_padding(payload, flags.contains(HeadersFlags::PADDED))?;

    let mut priority = None;
    if flags.contains(HeadersFlags::PRIORITY) {
        if block.len() < 5 {
            return Err(H2Error::conn(
                ErrorType::FrameSizeError,
                "HEADERS priority block truncated",
            ));
        }
        // unwrap: the length of the slice is always 4
        let raw = u32::from_be_bytes(block[0..4].try_into().unwrap());
        let dependency = raw & U31_MAX.get();
        if dependency == id.get() {
            return Err(H2Error::stream(
                id,
                ErrorType::ProtocolError,
                "stream depends on itself",
            ));
        }
        priority = Some((dependency, raw & !U31_MAX.get() != 0, block[4]));
        block = block.slice(5..);
    }

    let stream = inner.streams.get_mut(id).ok_or_else(|| {
        H2Error::conn(
            ErrorType::ProtocolError,
            format!("HEADERS on unknown stream {id}"),
        )
    })?;
    if stream.state.contains(StreamState::REMOTE_CLOSED) {
        return Err(H2Error::stream(
            id,
            ErrorType::StreamClosed,
            "HEADERS on a half-closed stream",
        ));
    }
    if let Some((dependency, exclusive, weight)) = priority {
        stream.dependency = Some(dependency);
        stream.exclusive_dependency = Some(exclusive);
        stream.weight = Some(weight);
    }

    let buffer = stream.headers.get_or_insert_with(BytesMut::new);
    buffer.extend_from_slice(&block);
    let oversized = buffer.len() > stream.max_header_size;
    if flags.contains(HeadersFlags::END_STREAM) {
        stream.state.insert(StreamState::REMOTE_CLOSED);
    }
    if oversized {
        if end_headers {
            // Still run the block through the decoder so its dynamic table
            // stays in sync with the peer's encoder.
            let block = stream.headers.take().unwrap_or_default();
            let _ = inner.decoder.decode(&block);
        }
        return Err(H2Error::stream(
            id,
            ErrorType::EnhanceYourCalm,
            "header block exceeds the per-request size limit",
        ));
    }
    if end_headers {
        assemble_headers(inner, id)?;
    } else {
        inner.continuation = Some(id);
    }
    Ok(())
}

fn on_continuation(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
) -> Result<(), H2Error> {
    let id = require_stream_id(header, "CONTINUATION")?;
    if inner.continuation != Some(id) {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "CONTINUATION without an open header block",
        ));
    }
    let end_headers =
        ContinuationFlags::from_bits_truncate(header.flags).contains(ContinuationFlags::END_HEADERS);

    if let Some(stream) = inner.streams.get_mut(id) {
        let buffer = stream.headers.get_or_insert_with(BytesMut::new);
        buffer.extend_from_slice(payload);
        if buffer.len() > stream.max_header_size {
            if end_headers {
                let block = stream.headers.take().unwrap_or_default();
                inner.continuation = None;
                let _ = inner.decoder.decode(&block);
            }
            return Err(H2Error::stream(
                id,
                ErrorType::EnhanceYourCalm,
                "header block exceeds the per-request size limit",
            ));
        }
        if end_headers {
            assemble_headers(inner, id)?;
        }
    } else if let Some((orphan_id, mut buffer)) = inner.orphan_headers.take() {
        // The stream was released mid-assembly (cancellation); the block must
        // still reach the decoder or the compression state diverges.
        buffer.extend_from_slice(payload);
        if buffer.len() > DEFAULT_MAX_HEADER_SIZE {
            return Err(H2Error::conn(
                ErrorType::EnhanceYourCalm,
                "header block for a released stream grew past the connection limit",
            ));
        }
        if end_headers {
            inner.continuation = None;
            let _ = inner.decoder.decode(&buffer);
        } else {
            inner.orphan_headers = Some((orphan_id, buffer));
        }
    } else if end_headers {
        inner.continuation = None;
    }
    Ok(())
}

/// Decode and validate a completed header block, then resolve the pending
/// request with a response head.
fn assemble_headers(inner: &mut ConnectionInner, id: NonZeroStreamId) -> Result<(), H2Error> {
    inner.continuation = None;
    let (block, remote_closed) = match inner.streams.get_mut(id) {
        Some(stream) => (
            stream.headers.take().unwrap_or_default(),
            stream.state.contains(StreamState::REMOTE_CLOSED),
        ),
        None => return Ok(()),
    };

    let decoded = inner.decoder.decode(&block).map_err(|err| {
        debug!("header block failed to decode: {:?}", err);
        H2Error::conn(ErrorType::CompressionError, "header block failed to decode")
    })?;
    let list_size: usize = decoded
        .iter()
        .map(|(name, value)| name.len() + value.len() + 32)
        .sum();
    if list_size > ADVERTISED_MAX_HEADER_LIST_SIZE as usize {
        return Err(H2Error::conn(
            ErrorType::CompressionError,
            "header list exceeds the advertised limit",
        ));
    }

    let mut headers = Headers::with_capacity(decoded.len());
    let mut regular_seen = false;
    let mut status_seen = false;
    for (name, value) in &decoded {
        if name.first() == Some(&b':') {
            if regular_seen {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    "pseudo-header after a regular header",
                ));
            }
            if name.as_slice() != b":status" {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    format!("unknown response pseudo-header {:?}", String::from_utf8_lossy(name)),
                ));
            }
            if status_seen {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    "duplicate :status pseudo-header",
                ));
            }
            status_seen = true;
        } else {
            if !valid_header_name(name) {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    format!("invalid header field name {:?}", String::from_utf8_lossy(name)),
                ));
            }
            regular_seen = true;
        }
        headers.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    if !status_seen {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "response without :status",
        ));
    }

    let expected_length = match parse_content_length(&headers) {
        Ok(expected) => expected,
        Err(()) => {
            return Err(H2Error::stream(
                id,
                ErrorType::ProtocolError,
                "invalid content-length header",
            ))
        }
    };

    let Some(stream) = inner.streams.get_mut(id) else {
        return Ok(());
    };
    if stream.state.contains(StreamState::RESERVED) {
        return Err(H2Error::stream(
            id,
            ErrorType::ProtocolError,
            "duplicate response head",
        ));
    }
    stream.state.insert(StreamState::RESERVED);

    if remote_closed {
        // Headers-only response; the exchange is complete.
        if let Some(mut stream) = inner.streams.release(id) {
            stream.finish(Ok(Response::new(headers, Body::empty())));
        }
    } else {
        stream.expected_length = expected_length;
        let (body_tx, body) = Body::channel();
        stream.body_tx = Some(body_tx);
        if let Some(tx) = stream.response_tx.take() {
            tx.send(Ok(Response::new(headers, body))).ok();
        }
    }
    Ok(())
}

/// Field names must be lowercase tokens: `^[\x21-\x40\x5b-\x7e]+$`.
fn valid_header_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name
            .iter()
            .all(|byte| matches!(byte, 0x21..=0x40 | 0x5b..=0x7e))
}

/// Strict decimal per `^(0|[1-9][0-9]*)$`; repeated equal values collapse,
/// disagreeing ones are an error.
fn parse_content_length(headers: &Headers) -> Result<Option<u64>, ()> {
    let mut result = None;
    for (name, value) in headers {
        if name != "content-length" {
            continue;
        }
        if value.is_empty()
            || !value.bytes().all(|byte| byte.is_ascii_digit())
            || (value.len() > 1 && value.starts_with('0'))
        {
            return Err(());
        }
        let parsed: u64 = value.parse().map_err(|_| ())?;
        match result {
            Some(existing) if existing != parsed => return Err(()),
            _ => result = Some(parsed),
        }
    }
    Ok(result)
}

fn on_rst_stream(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
) -> Result<(), H2Error> {
    let id = require_stream_id(header, "RST_STREAM")?;
    if header.length != 4 {
        return Err(H2Error::conn(
            ErrorType::FrameSizeError,
            "RST_STREAM with a length other than 4",
        ));
    }
    // unwrap: the length of the slice is always 4
    let raw = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let code = ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError);
    warn!("stream {} reset by server: {:?}", id, code);
    inner.release_err(id, Error::ServerReset { code });
    Ok(())
}

fn on_settings(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    if header.stream_id != 0 {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "SETTINGS frame on a stream",
        ));
    }
    if SettingsFlags::from_bits_truncate(header.flags).contains(SettingsFlags::ACK) {
        if header.length != 0 {
            return Err(H2Error::conn(
                ErrorType::FrameSizeError,
                "SETTINGS ACK with a payload",
            ));
        }
        return Ok(());
    }
    if header.length % 6 != 0 {
        return Err(H2Error::conn(
            ErrorType::FrameSizeError,
            "SETTINGS length not a multiple of 6",
        ));
    }
    if header.length > MAX_SETTINGS_LENGTH {
        return Err(H2Error::conn(
            ErrorType::EnhanceYourCalm,
            "SETTINGS frame with too many entries",
        ));
    }
    for (raw_id, value) in frame::parse_settings_payload(payload) {
        // spec says to ignore unknown settings
        if let Some(param) = SettingsParameter::from_u16(raw_id) {
            apply_setting(inner, param, value, out)?;
        }
    }
    frame::settings_ack(&mut out.frames);
    if !inner.settings_received {
        inner.settings_received = true;
        trace!("ready!");
        out.settings_ready = true;
    }
    Ok(())
}

fn apply_setting(
    inner: &mut ConnectionInner,
    param: SettingsParameter,
    value: u32,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    trace!("setting {:?} = {}", param, value);
    match param {
        SettingsParameter::InitialWindowSize => {
            if i64::from(value) > MAX_WINDOW {
                return Err(H2Error::conn(
                    ErrorType::FlowControlError,
                    "INITIAL_WINDOW_SIZE beyond 2^31-1",
                ));
            }
            // The delta applies to every stream window, not the connection
            // window (RFC 7540 §6.9.2).
            let delta =
                i64::from(value) - i64::from(inner.their_settings[SettingsParameter::InitialWindowSize]);
            for stream in inner.streams.iter_mut() {
                stream.send_window += delta;
                if stream.send_window > MAX_WINDOW {
                    return Err(H2Error::conn(
                        ErrorType::FlowControlError,
                        "stream window overflow from INITIAL_WINDOW_SIZE",
                    ));
                }
            }
            if delta > 0 {
                out.schedule_drain = true;
            }
        }
        SettingsParameter::MaxFrameSize => {
            if !(DEFAULT_MAX_FRAME_SIZE..1 << 24).contains(&value) {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    "MAX_FRAME_SIZE out of range",
                ));
            }
        }
        SettingsParameter::MaxConcurrentStreams => {
            inner.streams.set_max_concurrent(value);
        }
        SettingsParameter::EnablePush => {
            if value != 0 {
                return Err(H2Error::conn(
                    ErrorType::ProtocolError,
                    "server attempted to enable push",
                ));
            }
        }
        SettingsParameter::HeaderTableSize | SettingsParameter::MaxHeaderListSize => {}
    }
    inner.their_settings[param] = value;
    Ok(())
}

fn on_ping(header: FrameHeader, payload: &Bytes, out: &mut Outbox) -> Result<(), H2Error> {
    if header.stream_id != 0 {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "PING frame on a stream",
        ));
    }
    if header.length != 8 {
        return Err(H2Error::conn(
            ErrorType::FrameSizeError,
            "PING with a length other than 8",
        ));
    }
    if !PingFlags::from_bits_truncate(header.flags).contains(PingFlags::ACK) {
        frame::ping_ack(&mut out.frames, payload);
    }
    Ok(())
}

fn on_goaway(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    if header.stream_id != 0 {
        return Err(H2Error::conn(
            ErrorType::ProtocolError,
            "GOAWAY frame on a stream",
        ));
    }
    if header.length < 8 {
        return Err(H2Error::conn(
            ErrorType::FrameSizeError,
            "GOAWAY shorter than 8 bytes",
        ));
    }
    // unwrap: the length of the slices is always 4
    let last_stream_id = u32::from_be_bytes(payload[0..4].try_into().unwrap()) & U31_MAX.get();
    let raw = u32::from_be_bytes(payload[4..8].try_into().unwrap());
    let code = ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError);
    error!("Go away: {:?}", code);
    if payload.len() > 8 {
        if let Ok(text) = std::str::from_utf8(&payload[8..]) {
            debug!("Go away debug: {}", text);
        }
    }

    for id in inner.streams.ids() {
        // Streams the server never processed can be retried elsewhere.
        let retryable = id.get() > last_stream_id;
        inner.release_err(
            id,
            Error::GoneAway {
                last_stream_id,
                code,
                retryable,
            },
        );
    }
    inner.closed = true;
    out.close = Some(Error::GoneAway {
        last_stream_id,
        code,
        retryable: false,
    });
    Ok(())
}

fn on_window_update(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
    out: &mut Outbox,
) -> Result<(), H2Error> {
    if header.length != 4 {
        return Err(H2Error::conn(
            ErrorType::FrameSizeError,
            "WINDOW_UPDATE with a length other than 4",
        ));
    }
    // unwrap: the length of the slice is always 4
    let increment = u32::from_be_bytes(payload[0..4].try_into().unwrap()) & U31_MAX.get();

    if let Some(id) = NonZeroStreamId::new(header.stream_id) {
        if increment == 0 {
            return Err(H2Error::stream(
                id,
                ErrorType::ProtocolError,
                "WINDOW_UPDATE with a zero increment",
            ));
        }
        // The stream may already be released; stale credit is ignored.
        if let Some(stream) = inner.streams.get_mut(id) {
            flow::apply_window_update(&mut stream.send_window, increment).map_err(|()| {
                H2Error::stream(id, ErrorType::FlowControlError, "stream window overflow")
            })?;
            out.schedule_drain = true;
        }
    } else {
        if increment == 0 {
            return Err(H2Error::conn(
                ErrorType::ProtocolError,
                "connection WINDOW_UPDATE with a zero increment",
            ));
        }
        flow::apply_window_update(&mut inner.send_window, increment).map_err(|()| {
            H2Error::conn(ErrorType::FlowControlError, "connection window overflow")
        })?;
        out.schedule_drain = true;
    }
    Ok(())
}

fn on_priority(
    inner: &mut ConnectionInner,
    header: FrameHeader,
    payload: &Bytes,
) -> Result<(), H2Error> {
    let id = require_stream_id(header, "PRIORITY")?;
    if header.length != 5 {
        return Err(H2Error::stream(
            id,
            ErrorType::FrameSizeError,
            "PRIORITY with a length other than 5",
        ));
    }
    // unwrap: the length of the slice is always 4
    let raw = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let dependency = raw & U31_MAX.get();
    if dependency == id.get() {
        return Err(H2Error::stream(
            id,
            ErrorType::ProtocolError,
            "stream depends on itself",
        ));
    }
    // Recorded but never acted upon.
    if let Some(stream) = inner.streams.get_mut(id) {
        stream.dependency = Some(dependency);
        stream.exclusive_dependency = Some(raw & !U31_MAX.get() != 0);
        stream.weight = Some(payload[4]);
    }
    Ok(())
}
