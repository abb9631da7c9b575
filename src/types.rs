use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// Header list in emission order. HTTP/2 preserves order and allows repeats.
pub type Headers = Vec<(String, String)>;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1 << 30;
/// Maximum flow-control window, 2^31 - 1.
pub const MAX_WINDOW: i64 = (u32::MAX >> 1) as i64;
/// Upper bound we place on a single inbound SETTINGS frame (10 entries).
pub const MAX_SETTINGS_LENGTH: u32 = 60;
/// What we advertise in our initial SETTINGS frame.
pub const ADVERTISED_MAX_CONCURRENT_STREAMS: u32 = 256;
pub const ADVERTISED_MAX_HEADER_LIST_SIZE: u32 = 1 << 20;

#[derive(thiserror::Error, Debug)]
pub enum FrameDecodeError {
    #[error("frame of {length} bytes exceeds the maximum frame size of {max} bytes")]
    Oversized { length: u32, max: u32 },
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// The associated condition is not a result of an error. For example, a GOAWAY might include this code to indicate graceful shutdown of a connection.
    NoError = 0x0,
    /// The endpoint detected an unspecific protocol error. This error is for use when a more specific error code is not available.
    ProtocolError = 0x1,
    /// The endpoint encountered an unexpected internal error.
    InternalError = 0x2,
    /// The endpoint detected that its peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// The endpoint sent a SETTINGS frame but did not receive a response in a timely manner. See Section 6.5.3 ("Settings Synchronization").
    SettingsTimeout = 0x4,
    /// The endpoint received a frame after a stream was half-closed.
    StreamClosed = 0x5,
    /// The endpoint received a frame with an invalid size.
    FrameSizeError = 0x6,
    /// The endpoint refused the stream prior to performing any application processing (see Section 8.1.4 for details).
    RefusedStream = 0x7,
    /// Used by the endpoint to indicate that the stream is no longer needed.
    Cancel = 0x8,
    /// The endpoint is unable to maintain the header compression context for the connection.
    CompressionError = 0x9,
    /// The connection established in response to a CONNECT request (Section 8.3) was reset or abnormally closed.
    ConnectError = 0xa,
    /// The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The underlying transport has properties that do not meet minimum security requirements (see Section 9.2).
    InadequateSecurity = 0xc,
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Allows the sender to inform the remote endpoint of the maximum size of the header compression table used to decode header blocks, in octets. The encoder can select any size equal to or less than this value by using signaling specific to the header compression format inside a header block (see [COMPRESSION]). The initial value is 4,096 octets.
    HeaderTableSize = 0x1,
    /// This setting can be used to disable server push (Section 8.2). An endpoint MUST NOT send a PUSH_PROMISE frame if it receives this parameter set to a value of 0. An endpoint that has both set this parameter to 0 and had it acknowledged MUST treat the receipt of a PUSH_PROMISE frame as a connection error (Section 5.4.1) of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Indicates the maximum number of concurrent streams that the sender will allow. This limit is directional: it applies to the number of streams that the sender permits the receiver to create.
    MaxConcurrentStreams = 0x3,
    /// Indicates the sender's initial window size (in octets) for stream-level flow control. The initial value is 2^16-1 (65,535) octets.
    /// Values above the maximum flow-control window size of 2^31-1 MUST be treated as a connection error (Section 5.4.1) of type FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Indicates the size of the largest frame payload that the sender is willing to receive, in octets.
    /// The value advertised by an endpoint MUST be between 2^14 and 2^24-1 octets, inclusive.
    MaxFrameSize = 0x5,
    /// This advisory setting informs a peer of the maximum size of header list that the sender is prepared to accept, in octets.
    MaxHeaderListSize = 0x6,
}

/// Outcome of a request or of the connection as a whole, as surfaced to callers.
///
/// Stream-scoped variants fail only the request they belong to; connection-scoped
/// variants are delivered identically to every in-flight request before the
/// socket is torn down.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The peer violated the protocol in a way that poisons the whole connection.
    #[error("connection error ({code:?}): {reason}")]
    Connection { code: ErrorType, reason: String },
    /// This exchange failed validation; the connection remains usable.
    #[error("stream error ({code:?}): {reason}")]
    Stream { code: ErrorType, reason: String },
    /// The server ended this stream with RST_STREAM.
    #[error("stream reset by server ({code:?})")]
    ServerReset { code: ErrorType },
    /// The server sent GOAWAY. Requests on streams above `last_stream_id` were
    /// never processed and may be retried on a fresh connection.
    #[error("server sent GOAWAY (last stream {last_stream_id}, {code:?})")]
    GoneAway {
        last_stream_id: StreamId,
        code: ErrorType,
        retryable: bool,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("socket disconnected: {0}")]
    Disconnected(String),
    #[error("no concurrent streams remaining on connection")]
    TooManyStreams,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// True when the request is known not to have been processed by the server,
    /// so resubmitting it on another connection is safe.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GoneAway {
                retryable: true,
                ..
            } | Self::TooManyStreams
        )
    }
}

/// Internal severity split for inbound protocol faults.
#[derive(Debug)]
pub(crate) enum H2Error {
    /// Send GOAWAY, fail every stream, close the socket.
    Connection { code: ErrorType, reason: String },
    /// Send RST_STREAM for `id` and release that stream only.
    Stream {
        id: NonZeroStreamId,
        code: ErrorType,
        reason: &'static str,
    },
}

impl H2Error {
    pub(crate) fn conn(code: ErrorType, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn stream(id: NonZeroStreamId, code: ErrorType, reason: &'static str) -> Self {
        Self::Stream { id, code, reason }
    }
}
