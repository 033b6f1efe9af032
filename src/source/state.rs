//! Source state record

use crate::buffer::ChunkQueue;
use crate::chunk::{Chunk, Encoding};
use crate::config::{StreamConfig, MAX_HIGH_WATER_MARK};
use crate::error::{Callback, StreamError};
use crate::sink::SinkStream;
use crate::stats::SourceStats;

use super::pipe::PipeLink;

/// Smallest power of two at or above `n`, capped at 2^30
pub fn compute_new_high_water_mark(n: usize) -> usize {
    if n >= MAX_HIGH_WATER_MARK {
        return MAX_HIGH_WATER_MARK;
    }
    let mut n = n.wrapping_sub(1);
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n.wrapping_add(1)
}

/// Destroy requested before the construct hook completed
pub(crate) struct PendingDestroy {
    pub error: Option<StreamError>,
    pub callback: Option<Callback>,
}

/// Mutable state of a [`SourceStream`](super::SourceStream)
pub(crate) struct SourceState {
    pub high_water_mark: usize,
    pub object_mode: bool,
    pub default_encoding: Encoding,
    pub emit_close: bool,
    pub auto_destroy: bool,

    pub buffer: ChunkQueue,
    /// Sum of queued chunk lengths
    pub length: usize,

    /// None until a consumer picks a mode
    pub flowing: Option<bool>,
    /// Explicit `pause` / `resume` request
    pub paused: Option<bool>,

    pub ended: bool,
    pub end_emitted: bool,
    /// A read hook call is outstanding
    pub reading: bool,
    /// Inside a synchronous read hook call
    pub sync: bool,
    pub constructed: bool,
    pub need_readable: bool,
    pub emitted_readable: bool,
    pub readable_listening: bool,
    pub resume_scheduled: bool,
    pub reading_more: bool,
    pub data_emitted: bool,

    pub destroyed: bool,
    pub closed: bool,
    pub close_emitted: bool,
    pub errored: Option<StreamError>,
    pub pending_destroy: Option<PendingDestroy>,

    pub pipes: Vec<PipeLink>,
    /// Destinations that asked for a pause and have not drained yet
    pub await_drain: Vec<SinkStream>,

    pub chunks_pushed: u64,
    pub units_pushed: u64,
    pub chunks_delivered: u64,
    pub units_delivered: u64,
}

impl SourceState {
    pub fn new(config: &StreamConfig, constructed: bool, sync: bool) -> Self {
        Self {
            high_water_mark: config.resolved_high_water_mark(),
            object_mode: config.object_mode,
            default_encoding: config.default_encoding,
            emit_close: config.emit_close,
            auto_destroy: config.auto_destroy,
            buffer: ChunkQueue::new(),
            length: 0,
            flowing: None,
            paused: None,
            ended: false,
            end_emitted: false,
            reading: false,
            sync,
            constructed,
            need_readable: false,
            emitted_readable: false,
            readable_listening: false,
            resume_scheduled: false,
            reading_more: false,
            data_emitted: false,
            destroyed: false,
            closed: false,
            close_emitted: false,
            errored: None,
            pending_destroy: None,
            pipes: Vec::new(),
            await_drain: Vec::new(),
            chunks_pushed: 0,
            units_pushed: 0,
            chunks_delivered: 0,
            units_delivered: 0,
        }
    }

    pub fn is_flowing(&self) -> bool {
        self.flowing == Some(true)
    }

    pub fn unit_len(&self, chunk: &Chunk) -> usize {
        if self.object_mode {
            1
        } else {
            chunk.len()
        }
    }

    /// Turn text into octets and reject objects outside object mode
    pub fn normalize(&self, chunk: Chunk, encoding: Option<Encoding>) -> Result<Chunk, StreamError> {
        if self.object_mode {
            return Ok(chunk);
        }
        match chunk {
            Chunk::Bytes(bytes) => Ok(Chunk::Bytes(bytes)),
            Chunk::Text(text) => {
                let encoding = encoding.unwrap_or(self.default_encoding);
                Ok(Chunk::Bytes(encoding.encode(&text)))
            }
            Chunk::Object(_) => Err(StreamError::InvalidChunk(
                "object chunks require object mode",
            )),
        }
    }

    /// Number of units a `read(n)` call should return
    ///
    /// `None` means the caller did not ask for a size.
    pub fn how_much_to_read(&self, n: Option<usize>) -> usize {
        if n == Some(0) || (self.length == 0 && self.ended) {
            return 0;
        }
        if self.object_mode {
            return 1;
        }
        match n {
            None => match self.buffer.first() {
                Some(first) if self.is_flowing() && self.length > 0 => first.len(),
                _ => self.length,
            },
            Some(n) if n <= self.length => n,
            Some(_) if self.ended => self.length,
            Some(_) => 0,
        }
    }

    /// Take `n` units off the queue
    pub fn from_list(&mut self, n: usize) -> Option<Chunk> {
        if self.length == 0 {
            return None;
        }
        if self.object_mode {
            return self.buffer.shift();
        }
        if n >= self.length {
            let chunk = if self.buffer.len() == 1 {
                self.buffer.shift()
            } else {
                Some(Chunk::Bytes(self.buffer.concat(self.length)))
            };
            self.buffer.clear();
            chunk
        } else {
            self.buffer.consume(n)
        }
    }

    pub fn clear_await_drain(&mut self) {
        self.await_drain.clear();
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            buffered_units: self.length,
            buffered_chunks: self.buffer.len(),
            chunks_pushed: self.chunks_pushed,
            units_pushed: self.units_pushed,
            chunks_delivered: self.chunks_delivered,
            units_delivered: self.units_delivered,
            high_water_mark: self.high_water_mark,
        }
    }
}
