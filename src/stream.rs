use crate::{response::Response, types::*};
use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

bitflags! {
    /// Half-close bookkeeping for a single exchange.
    #[repr(transparent)]
    pub struct StreamState: u8 {
        /// The response head has been received for this stream.
        const RESERVED = 0x1;
        /// The peer will send no further frames carrying payload.
        const REMOTE_CLOSED = 0x2;
        /// We will send no further DATA for this stream.
        const LOCAL_CLOSED = 0x4;
    }
}

/// One in-flight request/response exchange.
///
/// Streams never reference the connection; the frame processor and the request
/// driver reach them through the stream table by id, and must re-check
/// existence after any suspension.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    pub state: StreamState,
    /// Inbound flow-control credit we have granted the peer.
    pub recv_window: i64,
    /// Outbound credit the peer has granted us.
    pub send_window: i64,
    /// Assembly buffer for an in-progress header block; `None` outside
    /// HEADERS..CONTINUATION sequences.
    pub headers: Option<BytesMut>,
    /// Outbound body bytes waiting for window credit.
    pub buffer: BytesMut,
    /// A zero-or-more-byte END_STREAM DATA emission is still owed.
    pub end_stream_queued: bool,
    /// Declared `content-length`, when present.
    pub expected_length: Option<u64>,
    /// Body bytes received so far; bounded by `max_body_size`.
    pub received: u64,
    pub max_header_size: usize,
    pub max_body_size: usize,
    /// Woken whenever send credit drains this stream's buffer or the stream
    /// is released.
    pub send_waiter: Arc<Notify>,
    pub dependency: Option<StreamId>,
    pub exclusive_dependency: Option<bool>,
    pub weight: Option<u8>,
    #[derivative(Debug = "ignore")]
    pub response_tx: Option<oneshot::Sender<Result<Response, Error>>>,
    #[derivative(Debug = "ignore")]
    pub body_tx: Option<mpsc::UnboundedSender<Result<Bytes, Error>>>,
}

impl Stream {
    #[must_use]
    pub fn new(
        id: NonZeroStreamId,
        send_window: i64,
        recv_window: i64,
        max_header_size: usize,
        max_body_size: usize,
    ) -> Self {
        Self {
            id,
            state: StreamState::empty(),
            recv_window,
            send_window,
            headers: None,
            buffer: BytesMut::new(),
            end_stream_queued: false,
            expected_length: None,
            received: 0,
            max_header_size,
            max_body_size,
            send_waiter: Arc::new(Notify::new()),
            dependency: None,
            exclusive_dependency: None,
            weight: None,
            response_tx: None,
            body_tx: None,
        }
    }

    /// Deliver one body chunk to the response reader. The sink may already be
    /// gone when the consumer dropped the body mid-flight; that is not an
    /// error here.
    pub fn push_body_chunk(&self, chunk: Bytes) {
        if let Some(tx) = &self.body_tx {
            tx.send(Ok(chunk)).ok();
        }
    }

    /// Complete the exchange with `result`, whichever sink is still armed.
    pub fn finish(&mut self, result: Result<Response, Error>) {
        match result {
            Ok(response) => {
                if let Some(tx) = self.response_tx.take() {
                    tx.send(Ok(response)).ok();
                }
                self.body_tx = None;
            }
            Err(err) => {
                if let Some(tx) = self.response_tx.take() {
                    tx.send(Err(err.clone())).ok();
                }
                if let Some(tx) = self.body_tx.take() {
                    tx.send(Err(err)).ok();
                }
            }
        }
        self.send_waiter.notify_one();
    }
}
