use crate::{
    flow, frame,
    frame::{FrameDecoder, FrameHeader},
    processor,
    processor::Outbox,
    request::{Cancellation, Request, RequestBody},
    response::Response,
    stream::StreamState,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::{Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use log::{debug, error, trace};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf},
    sync::{oneshot, watch},
};

/// Address and TLS facts captured when the socket was established.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub tls: Option<TlsInfo>,
}

#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub alpn_protocol: Option<Vec<u8>>,
    pub protocol_version: Option<String>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CloseCallback = Box<dyn FnOnce() + Send>;

/// Mutable connection state. Guarded by a plain mutex that is never held
/// across an await; every suspension point re-acquires and revalidates.
pub(crate) struct ConnectionInner {
    pub(crate) streams: StreamCoordinator,
    /// Connection-level credit the peer granted us.
    pub(crate) send_window: i64,
    /// Connection-level credit we granted the peer.
    pub(crate) recv_window: i64,
    pub(crate) their_settings: EnumMap<SettingsParameter, u32>,
    pub(crate) encoder: hpack::Encoder<'static>,
    pub(crate) decoder: hpack::Decoder<'static>,
    /// Stream id whose header block is still open (awaiting CONTINUATION).
    pub(crate) continuation: Option<NonZeroStreamId>,
    /// Partial header block of a stream released mid-assembly; kept so the
    /// HPACK dynamic table can still be synchronized at END_HEADERS.
    pub(crate) orphan_headers: Option<(NonZeroStreamId, BytesMut)>,
    pub(crate) settings_tx: watch::Sender<bool>,
    pub(crate) settings_received: bool,
    pub(crate) closed: bool,
    /// Highest peer-sent stream id we processed; reported in GOAWAY.
    pub(crate) last_remote_id: StreamId,
    /// `Some` until the close path drains it, exactly once.
    pub(crate) on_close: Option<Vec<CloseCallback>>,
}

impl ConnectionInner {
    /// Release after a fully-delivered exchange: drop the table slot and let
    /// the body channel close cleanly.
    pub(crate) fn release_ok(&mut self, id: NonZeroStreamId) {
        if let Some(mut stream) = self.streams.release(id) {
            stream.body_tx = None;
            stream.send_waiter.notify_one();
        }
    }

    /// Release with an error, failing whichever sink is still armed.
    pub(crate) fn release_err(&mut self, id: NonZeroStreamId, error: Error) {
        if let Some(mut stream) = self.streams.release(id) {
            if self.continuation == Some(id) {
                if let Some(buffer) = stream.headers.take() {
                    self.orphan_headers = Some((id, buffer));
                }
            }
            stream.finish(Err(error));
        }
    }

    pub(crate) fn fail_all(&mut self, error: &Error) {
        for id in self.streams.ids() {
            self.release_err(id, error.clone());
        }
    }
}

struct Shared {
    inner: Mutex<ConnectionInner>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    settings_rx: watch::Receiver<bool>,
    /// Idle-tracking hint: in-flight exchanges referencing the socket.
    refs: AtomicUsize,
    info: ConnectionInfo,
}

/// An established HTTP/2 client connection multiplexing concurrent requests
/// over one socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Write the client preface and our SETTINGS, then start the reader task.
    pub async fn handshake<S>(socket: S, info: ConnectionInfo) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(socket);
        let (settings_tx, settings_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            inner: Mutex::new(ConnectionInner {
                streams: StreamCoordinator::default(),
                send_window: i64::from(DEFAULT_WINDOW_SIZE),
                recv_window: i64::from(DEFAULT_WINDOW_SIZE),
                their_settings: enum_map! {
                    SettingsParameter::HeaderTableSize => 4096,
                    SettingsParameter::EnablePush => 1,
                    SettingsParameter::MaxConcurrentStreams => u32::MAX,
                    SettingsParameter::InitialWindowSize => DEFAULT_WINDOW_SIZE,
                    SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
                    SettingsParameter::MaxHeaderListSize => u32::MAX,
                },
                encoder: hpack::Encoder::new(),
                decoder: hpack::Decoder::new(),
                continuation: None,
                orphan_headers: None,
                settings_tx,
                settings_received: false,
                closed: false,
                last_remote_id: 0,
                on_close: Some(Vec::new()),
            }),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            settings_rx,
            refs: AtomicUsize::new(0),
            info,
        });

        // client connection preface
        let mut hello = BytesMut::from(PREFACE);
        frame::encode_frame(
            &mut hello,
            FrameType::Settings,
            0,
            0,
            &frame::settings_payload(&[
                (SettingsParameter::EnablePush, 0),
                (
                    SettingsParameter::MaxConcurrentStreams,
                    ADVERTISED_MAX_CONCURRENT_STREAMS,
                ),
                (SettingsParameter::InitialWindowSize, DEFAULT_WINDOW_SIZE),
                (
                    SettingsParameter::MaxHeaderListSize,
                    ADVERTISED_MAX_HEADER_LIST_SIZE,
                ),
                (SettingsParameter::MaxFrameSize, DEFAULT_MAX_FRAME_SIZE),
            ]),
        );
        shared.write_frames(hello.freeze()).await?;

        tokio::spawn(run_reader(shared.clone(), reader));
        Ok(Self { shared })
    }

    /// Dispatch one request over this connection.
    ///
    /// Completes once the response head arrives; the body streams afterwards.
    /// Cancellation sends RST_STREAM(CANCEL) and fails only this exchange.
    pub async fn request(
        &self,
        request: Request,
        mut cancellation: Cancellation,
    ) -> Result<Response, Error> {
        self.await_settings().await?;
        let _guard = self.shared.reference();

        let header_list = request.header_list()?;
        let (id, response_rx, block, max_frame) = {
            let mut inner = self.shared.inner.lock().expect("connection state");
            if inner.closed {
                return Err(Error::Disconnected("connection closed".into()));
            }
            let send_window =
                i64::from(inner.their_settings[SettingsParameter::InitialWindowSize]);
            let id = inner.streams.allocate(
                send_window,
                i64::from(DEFAULT_WINDOW_SIZE),
                request.max_header_size,
                request.max_body_size,
            )?;
            let (response_tx, response_rx) = oneshot::channel();
            // unwrap: the stream was just inserted
            inner.streams.get_mut(id).unwrap().response_tx = Some(response_tx);
            let block = inner
                .encoder
                .encode(header_list.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())));
            let max_frame = inner.their_settings[SettingsParameter::MaxFrameSize] as usize;
            (id, response_rx, block, max_frame)
        };
        trace!("stream {}: {} {}", id, request.method, request.url);

        tokio::select! {
            result = self.drive(id, block, max_frame, request.body, response_rx) => result,
            _ = cancellation.cancelled() => {
                self.cancel_stream(id).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Emit the header block, pump the body with one chunk of lookahead so
    /// the final chunk carries END_STREAM, then await the response head.
    async fn drive(
        &self,
        id: NonZeroStreamId,
        block: Vec<u8>,
        max_frame: usize,
        mut body: RequestBody,
        response_rx: oneshot::Receiver<Result<Response, Error>>,
    ) -> Result<Response, Error> {
        let first = body.next_chunk().await;
        self.write_header_block(id, &block, first.is_none(), max_frame)
            .await?;
        if let Some(mut current) = first {
            loop {
                match body.next_chunk().await {
                    Some(next) => {
                        self.write_data(id, current, false).await?;
                        current = next;
                    }
                    None => {
                        self.write_data(id, current, true).await?;
                        break;
                    }
                }
            }
        }
        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected(
                "connection closed before a response arrived".into(),
            )),
        }
    }

    async fn await_settings(&self) -> Result<(), Error> {
        let mut settings = self.shared.settings_rx.clone();
        loop {
            if *settings.borrow() {
                break;
            }
            if settings.changed().await.is_err() {
                break;
            }
        }
        let inner = self.shared.inner.lock().expect("connection state");
        if inner.closed && !inner.settings_received {
            return Err(Error::Disconnected(
                "connection closed during the settings exchange".into(),
            ));
        }
        Ok(())
    }

    async fn cancel_stream(&self, id: NonZeroStreamId) {
        let existed = {
            let mut inner = self.shared.inner.lock().expect("connection state");
            let existed = inner.streams.get(id).is_some();
            inner.release_err(id, Error::Cancelled);
            existed
        };
        if existed {
            debug!("stream {}: cancelled", id);
            let mut buf = BytesMut::new();
            frame::rst_stream(&mut buf, id.get(), ErrorType::Cancel);
            self.shared.write_frames(buf.freeze()).await.ok();
        }
    }

    /// One HEADERS frame plus CONTINUATION frames as needed, written
    /// contiguously so no other sender interleaves the block.
    async fn write_header_block(
        &self,
        id: NonZeroStreamId,
        block: &[u8],
        end_stream: bool,
        max_frame: usize,
    ) -> Result<(), Error> {
        let mut writer = self.shared.writer.lock().await;
        let frames = {
            let mut inner = self.shared.inner.lock().expect("connection state");
            let Some(stream) = inner.streams.get_mut(id) else {
                // Released while we awaited the writer; the response sink
                // carries the outcome.
                return Ok(());
            };
            if end_stream {
                stream.state.insert(StreamState::LOCAL_CLOSED);
            }
            let mut frames = BytesMut::new();
            frame::encode_header_block(&mut frames, id.get(), block, end_stream, max_frame);
            frames
        };
        Shared::write_locked(&mut writer, &frames).await
    }

    /// Queue body bytes and complete once the socket accepted all of them.
    /// Bytes beyond the current window credit stay buffered; every credit
    /// grant re-arms the drain until the buffer is empty.
    async fn write_data(
        &self,
        id: NonZeroStreamId,
        chunk: Bytes,
        end_stream: bool,
    ) -> Result<(), Error> {
        {
            let mut inner = self.shared.inner.lock().expect("connection state");
            let Some(stream) = inner.streams.get_mut(id) else {
                return Ok(());
            };
            stream.buffer.extend_from_slice(&chunk);
            if end_stream {
                stream.state.insert(StreamState::LOCAL_CLOSED);
                stream.end_stream_queued = true;
            }
        }
        loop {
            self.shared.flush_sendable().await?;
            let waiter = {
                let inner = self.shared.inner.lock().expect("connection state");
                match inner.streams.get(id) {
                    None => return Ok(()),
                    Some(stream) if stream.buffer.is_empty() && !stream.end_stream_queued => {
                        return Ok(())
                    }
                    Some(stream) => stream.send_waiter.clone(),
                }
            };
            waiter.notified().await;
        }
    }

    /// True when this connection cannot take another request right now.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let inner = self.shared.inner.lock().expect("connection state");
        inner.closed || inner.streams.remaining() == 0
    }

    /// Register a callback fired exactly once when the connection closes.
    /// Registration after close invokes the callback immediately.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.shared.inner.lock().expect("connection state");
        if let Some(callbacks) = inner.on_close.as_mut() {
            callbacks.push(Box::new(callback));
            return;
        }
        drop(inner);
        callback();
    }

    /// Graceful shutdown: GOAWAY naming the highest open stream, then close
    /// the socket and fail whatever was still in flight. Idempotent.
    pub async fn close(&self) {
        let last_stream_id = {
            let inner = self.shared.inner.lock().expect("connection state");
            inner.streams.max_open_id()
        };
        self.shared
            .finish_close(
                Error::Disconnected("connection closed".into()),
                Some((last_stream_id, ErrorType::NoError, b"graceful shutdown".to_vec())),
            )
            .await;
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.info.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.info.remote_addr
    }

    #[must_use]
    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.shared.info.tls.as_ref()
    }

    /// Exchanges currently holding the socket open; an idle-tracking hint for
    /// pool layers.
    #[must_use]
    pub fn references(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn reference(self: &Arc<Self>) -> RefGuard {
        self.refs.fetch_add(1, Ordering::SeqCst);
        RefGuard {
            shared: self.clone(),
        }
    }

    async fn write_frames(&self, frames: Bytes) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        Self::write_locked(&mut writer, &frames).await
    }

    /// All frame emission funnels through here while the writer lock is held,
    /// which is what makes frames atomic at the socket boundary.
    async fn write_locked(
        writer: &mut Option<BoxedWriter>,
        frames: &[u8],
    ) -> Result<(), Error> {
        let Some(writer) = writer.as_mut() else {
            return Err(Error::Disconnected("connection closed".into()));
        };
        writer
            .write_all(frames)
            .await
            .map_err(|err| Error::Disconnected(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| Error::Disconnected(err.to_string()))
    }

    /// Buffered-send pass: drain every stream with credit. The stream state
    /// is inspected only while the writer lock is held so a concurrent pass
    /// cannot reorder one stream's DATA frames.
    async fn flush_sendable(&self) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let batch = {
            let mut inner = self.inner.lock().expect("connection state");
            let max_frame = inner.their_settings[SettingsParameter::MaxFrameSize] as usize;
            let inner = &mut *inner;
            flow::collect_sendable(&mut inner.streams, &mut inner.send_window, max_frame)
        };
        if !batch.is_empty() {
            Self::write_locked(&mut writer, &batch.frames).await?;
        }
        drop(writer);
        for waiter in batch.emptied {
            waiter.notify_one();
        }
        Ok(())
    }

    /// Single teardown path. The first caller wins: it drains the callback
    /// list, fails all remaining streams, optionally emits GOAWAY, and shuts
    /// the socket down. Later callers return immediately.
    async fn finish_close(
        &self,
        error: Error,
        goaway: Option<(StreamId, ErrorType, Vec<u8>)>,
    ) {
        let callbacks = {
            let mut inner = self.inner.lock().expect("connection state");
            let Some(callbacks) = inner.on_close.take() else {
                return;
            };
            inner.closed = true;
            inner.fail_all(&error);
            // Wake settings waiters so they observe the closed flag.
            let _ = inner.settings_tx.send(true);
            callbacks
        };
        if let Some((last_stream_id, code, debug_data)) = goaway {
            let mut buf = BytesMut::new();
            frame::goaway(&mut buf, last_stream_id, code, &debug_data);
            self.write_frames(buf.freeze()).await.ok();
        }
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut writer) = writer.take() {
                writer.shutdown().await.ok();
            }
        }
        for callback in callbacks {
            callback();
        }
    }

    async fn connection_error(self: &Arc<Self>, code: ErrorType, reason: String) {
        error!("connection error ({:?}): {}", code, reason);
        let last_remote_id = {
            let inner = self.inner.lock().expect("connection state");
            inner.last_remote_id
        };
        self.finish_close(
            Error::Connection {
                code,
                reason: reason.clone(),
            },
            Some((last_remote_id, code, reason.into_bytes())),
        )
        .await;
    }

    /// Handle one inbound frame; returns false when the reader must stop.
    async fn process_frame(self: &Arc<Self>, header: FrameHeader, payload: Bytes) -> bool {
        trace!(
            "frame type {:#x} flags {:#x} stream {} length {}",
            header.typ,
            header.flags,
            header.stream_id,
            header.length
        );
        let mut out = Outbox::default();
        let result = {
            let mut inner = self.inner.lock().expect("connection state");
            processor::handle_frame(&mut inner, header, &payload, &mut out)
        };
        if !out.frames.is_empty() && self.write_frames(out.frames.freeze()).await.is_err() {
            self.finish_close(Error::Disconnected("socket write failed".into()), None)
                .await;
            return false;
        }
        if out.settings_ready {
            // Only after the ACK is on the wire; a woken request must not get
            // its HEADERS ahead of it.
            let inner = self.inner.lock().expect("connection state");
            let _ = inner.settings_tx.send(true);
        }
        if out.schedule_drain {
            // Deferred to a later tick so administrative frames flush first.
            let shared = self.clone();
            tokio::spawn(async move {
                shared.flush_sendable().await.ok();
            });
        }
        match result {
            Ok(()) => {
                if let Some(error) = out.close {
                    self.finish_close(error, None).await;
                    return false;
                }
                true
            }
            Err(H2Error::Stream { id, code, reason }) => {
                debug!("stream {} error ({:?}): {}", id, code, reason);
                let mut buf = BytesMut::new();
                frame::rst_stream(&mut buf, id.get(), code);
                let write = self.write_frames(buf.freeze()).await;
                {
                    let mut inner = self.inner.lock().expect("connection state");
                    inner.release_err(
                        id,
                        Error::Stream {
                            code,
                            reason: reason.to_owned(),
                        },
                    );
                }
                if write.is_err() {
                    self.finish_close(Error::Disconnected("socket write failed".into()), None)
                        .await;
                    return false;
                }
                true
            }
            Err(H2Error::Connection { code, reason }) => {
                self.connection_error(code, reason).await;
                false
            }
        }
    }
}

struct RefGuard {
    shared: Arc<Shared>,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.shared.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The long-running reader: pull bytes off the socket, feed the frame
/// decoder, hand complete frames to the processor. Terminates on EOF, on a
/// socket error, or once a connection error tore the state down.
async fn run_reader<S>(shared: Arc<Shared>, mut reader: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
    let mut buf = BytesMut::with_capacity(2 * (FrameHeader::SIZE + DEFAULT_MAX_FRAME_SIZE as usize));
    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some((header, payload))) => {
                    if !shared.process_frame(header, payload).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    shared
                        .connection_error(ErrorType::FrameSizeError, err.to_string())
                        .await;
                    return;
                }
            }
        }
        buf.reserve(FrameHeader::SIZE + DEFAULT_MAX_FRAME_SIZE as usize);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("connection closed by peer");
                shared
                    .finish_close(
                        Error::Disconnected("connection closed by peer".into()),
                        None,
                    )
                    .await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                shared
                    .finish_close(Error::Disconnected(err.to_string()), None)
                    .await;
                return;
            }
        }
    }
}
