//! Readable streams
//!
//! A [`SourceStream`] buffers chunks produced by its read hook and hands them
//! to consumers either through `data` events (flowing mode) or explicit
//! `read` calls (paused mode). [`SourceStream::pipe`] connects it to a sink
//! with backpressure.

pub mod pipe;
mod state;
pub mod stream;

pub use pipe::PipeOptions;
pub use state::compute_new_high_water_mark;
pub use stream::{SourceBuilder, SourceStream};
