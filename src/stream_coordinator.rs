use crate::{stream::Stream, types::*};
use log::trace;
use std::collections::HashMap;

/// Table of live streams plus the client-side id counter and the concurrency
/// budget derived from the peer's MAX_CONCURRENT_STREAMS.
#[derive(Debug)]
pub struct StreamCoordinator {
    /// Next client stream id to hand out; odd, strictly increasing.
    next_id: StreamId,
    max_concurrent: u32,
    streams: HashMap<NonZeroStreamId, Stream>,
}

impl StreamCoordinator {
    /// Streams the peer still allows us to open.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.streams.len() as u32)
    }

    pub fn set_max_concurrent(&mut self, value: u32) {
        self.max_concurrent = value;
    }

    pub fn allocate(
        &mut self,
        send_window: i64,
        recv_window: i64,
        max_header_size: usize,
        max_body_size: usize,
    ) -> Result<NonZeroStreamId, Error> {
        if self.remaining() == 0 || self.next_id > U31_MAX.get() {
            return Err(Error::TooManyStreams);
        }
        // unwrap: next_id starts at 1 and only grows
        let id = NonZeroStreamId::new(self.next_id).unwrap();
        self.next_id += 2;
        self.streams.insert(
            id,
            Stream::new(id, send_window, recv_window, max_header_size, max_body_size),
        );
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: NonZeroStreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Remove the table slot. Callers check existence first; releasing an id
    /// twice is tolerated but traced, since it usually means two completion
    /// paths raced.
    pub fn release(&mut self, id: NonZeroStreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id);
        if stream.is_none() {
            trace!("release of already-released stream {}", id);
        }
        stream
    }

    pub fn ids(&self) -> Vec<NonZeroStreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Highest currently-open stream id, or 0 when the table is empty.
    #[must_use]
    pub fn max_open_id(&self) -> StreamId {
        self.streams.keys().map(|id| id.get()).max().unwrap_or(0)
    }

    /// Largest per-stream body cap among live streams; drives the connection
    /// window replenish watermark.
    #[must_use]
    pub fn largest_max_body(&self) -> usize {
        self.streams
            .values()
            .map(|stream| stream.max_body_size)
            .max()
            .unwrap_or(DEFAULT_MAX_BODY_SIZE)
    }
}

impl Default for StreamCoordinator {
    fn default() -> Self {
        Self {
            next_id: 1,
            max_concurrent: u32::MAX,
            streams: HashMap::new(),
        }
    }
}
