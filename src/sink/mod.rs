//! Writable streams
//!
//! A [`SinkStream`] accepts chunks through `write`, hands them one at a time
//! (or in batches through `writev`) to a write hook, and reports backpressure
//! when too much is pending.

mod state;
pub mod stream;

pub use stream::{AsSink, SinkBuilder, SinkStream};
