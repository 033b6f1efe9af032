//! Sink state record

use std::collections::VecDeque;

use crate::chunk::{Chunk, Encoding};
use crate::config::StreamConfig;
use crate::error::{Callback, StreamError};
use crate::stats::SinkStats;

/// A write waiting for the one in flight to complete
pub(crate) struct WriteRequest {
    pub chunk: Chunk,
    pub encoding: Encoding,
    pub callback: Option<Callback>,
}

/// Destroy requested before the construct hook completed
pub(crate) struct PendingDestroy {
    pub error: Option<StreamError>,
    pub callback: Option<Callback>,
}

/// Mutable state of a [`SinkStream`](super::SinkStream)
pub(crate) struct SinkState {
    pub high_water_mark: usize,
    pub object_mode: bool,
    pub decode_strings: bool,
    pub default_encoding: Encoding,
    pub emit_close: bool,
    pub auto_destroy: bool,

    /// Units accepted and not yet completed, including the one in flight
    pub length: usize,
    pub buffered: VecDeque<WriteRequest>,

    /// A write hook call is outstanding
    pub writing: bool,
    pub write_len: usize,
    pub write_cb: Option<Callback>,
    /// Inside a synchronous write or final hook call
    pub sync: bool,
    pub buffer_processing: bool,
    pub corked: u32,

    /// Callbacks (user, final, finish) still owed
    pub pending_cb: usize,
    pub need_drain: bool,

    pub ending: bool,
    pub ended: bool,
    pub prefinished: bool,
    pub final_called: bool,
    pub finished: bool,
    pub constructed: bool,
    pub destroyed: bool,
    pub closed: bool,
    pub close_emitted: bool,
    pub errored: Option<StreamError>,

    /// `end` callbacks waiting for `finish`
    pub on_finished: Vec<Callback>,
    pub pending_destroy: Option<PendingDestroy>,

    pub chunks_written: u64,
    pub units_written: u64,
    pub drains: u64,
}

impl SinkState {
    pub fn new(config: &StreamConfig, constructed: bool) -> Self {
        Self {
            high_water_mark: config.resolved_high_water_mark(),
            object_mode: config.object_mode,
            decode_strings: config.decode_strings,
            default_encoding: config.default_encoding,
            emit_close: config.emit_close,
            auto_destroy: config.auto_destroy,
            length: 0,
            buffered: VecDeque::new(),
            writing: false,
            write_len: 0,
            write_cb: None,
            sync: true,
            buffer_processing: false,
            corked: 0,
            pending_cb: 0,
            need_drain: false,
            ending: false,
            ended: false,
            prefinished: false,
            final_called: false,
            finished: false,
            constructed,
            destroyed: false,
            closed: false,
            close_emitted: false,
            errored: None,
            on_finished: Vec::new(),
            pending_destroy: None,
            chunks_written: 0,
            units_written: 0,
            drains: 0,
        }
    }

    /// Length of `chunk` in stream units
    pub fn unit_len(&self, chunk: &Chunk) -> usize {
        if self.object_mode {
            1
        } else {
            chunk.len()
        }
    }

    /// Apply chunk type and encoding rules for an incoming write
    pub fn normalize(
        &self,
        chunk: Chunk,
        encoding: Option<Encoding>,
    ) -> Result<(Chunk, Encoding), StreamError> {
        let encoding = encoding.unwrap_or(self.default_encoding);
        if self.object_mode {
            return Ok((chunk, encoding));
        }
        match chunk {
            Chunk::Bytes(bytes) => Ok((Chunk::Bytes(bytes), Encoding::Buffer)),
            Chunk::Text(text) if self.decode_strings => {
                Ok((Chunk::Bytes(encoding.encode(&text)), Encoding::Buffer))
            }
            Chunk::Text(text) => Ok((Chunk::Text(text), encoding)),
            Chunk::Object(_) => Err(StreamError::InvalidChunk(
                "object chunks require object mode",
            )),
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            buffered_units: self.length,
            buffered_requests: self.buffered.len(),
            chunks_written: self.chunks_written,
            units_written: self.units_written,
            drains: self.drains,
        }
    }
}
