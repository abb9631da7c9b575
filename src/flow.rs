//! Flow-control arithmetic for both directions.
//!
//! Receive side decides when to replenish the peer's credit with
//! WINDOW_UPDATE frames; send side drains buffered body bytes whenever both
//! the connection window and the stream window permit.

use crate::{flags::DataFlags, frame, stream::Stream, stream_coordinator::StreamCoordinator, types::*};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::Notify;

/// Add a WINDOW_UPDATE increment, rejecting growth past 2^31 - 1.
pub fn apply_window_update(window: &mut i64, increment: u32) -> Result<(), ()> {
    let updated = *window + i64::from(increment);
    if updated > MAX_WINDOW {
        return Err(());
    }
    *window = updated;
    Ok(())
}

/// Connection-level replenish: once the window we granted drops below half of
/// the largest active per-stream body cap, top it back up to that cap.
pub fn connection_replenish(recv_window: i64, watermark: i64) -> Option<u32> {
    if recv_window < watermark / 2 {
        Some((watermark - recv_window).min(MAX_WINDOW) as u32)
    } else {
        None
    }
}

/// Stream-level replenish: grant more credit only once the stream window is
/// exhausted and the body cap still leaves room for more payload.
pub fn stream_replenish(stream: &Stream) -> Option<u32> {
    if stream.recv_window > 0 {
        return None;
    }
    let remaining = (stream.max_body_size as u64).saturating_sub(stream.received);
    if remaining == 0 {
        return None;
    }
    Some(remaining.min(MAX_WINDOW as u64) as u32)
}

/// Bytes a stream may emit right now, bounded by both window levels.
pub fn writable(connection_window: i64, stream: &Stream) -> usize {
    connection_window.max(0).min(stream.send_window.max(0)) as usize
}

/// DATA frames produced by one drain pass, plus the wakers of streams whose
/// buffers fully drained.
pub struct SendBatch {
    pub frames: BytesMut,
    pub emptied: Vec<Arc<Notify>>,
}

impl SendBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Drain every stream with buffered bytes and available credit, fragmenting
/// by the peer's max frame size. END_STREAM rides only on the final fragment
/// of a stream whose buffer this pass fully drains and whose local side is
/// closing.
pub fn collect_sendable(
    table: &mut StreamCoordinator,
    connection_window: &mut i64,
    max_frame_size: usize,
) -> SendBatch {
    let mut batch = SendBatch {
        frames: BytesMut::new(),
        emptied: Vec::new(),
    };

    for stream in table.iter_mut() {
        if stream.buffer.is_empty() && stream.end_stream_queued {
            // A zero-length terminal DATA frame needs no credit.
            encode_data(&mut batch.frames, stream.id.get(), &[], true, max_frame_size);
            stream.end_stream_queued = false;
            batch.emptied.push(stream.send_waiter.clone());
            continue;
        }
        if stream.buffer.is_empty() {
            continue;
        }

        let take = stream.buffer.len().min(writable(*connection_window, stream));
        if take == 0 {
            continue;
        }
        let data = stream.buffer.split_to(take);
        stream.send_window -= take as i64;
        *connection_window -= take as i64;

        let end_stream = stream.buffer.is_empty() && stream.end_stream_queued;
        encode_data(
            &mut batch.frames,
            stream.id.get(),
            &data,
            end_stream,
            max_frame_size,
        );
        if end_stream {
            stream.end_stream_queued = false;
        }
        if stream.buffer.is_empty() {
            batch.emptied.push(stream.send_waiter.clone());
        }
    }

    batch
}

/// Fragment one logical write into contiguous DATA frames of at most
/// `max_frame_size` bytes each.
fn encode_data(
    dst: &mut BytesMut,
    stream_id: StreamId,
    data: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    let mut chunks = data.chunks(max_frame_size.max(1));
    let total = chunks.len().max(1);
    let first = chunks.next().unwrap_or(&[]);

    let flags = |last: bool| {
        if last && end_stream {
            DataFlags::END_STREAM.bits()
        } else {
            0
        }
    };
    frame::encode_frame(dst, FrameType::Data, flags(total == 1), stream_id, first);
    for (index, chunk) in chunks.enumerate() {
        frame::encode_frame(
            dst,
            FrameType::Data,
            flags(index + 2 == total),
            stream_id,
            chunk,
        );
    }
}
