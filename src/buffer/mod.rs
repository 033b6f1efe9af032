//! Chunk buffering
//!
//! Sources keep pushed chunks in a [`ChunkQueue`] until a consumer reads
//! them. Reads may take less than a chunk or span several:
//!
//! ```text
//!   head                                      tail
//!    ┌──────────┐    ┌──────────┐    ┌──────────┐
//!    │ 10 bytes │───►│ 10 bytes │───►│ 10 bytes │
//!    └──────────┘    └──────────┘    └──────────┘
//!    ◄─────────── consume(25) ──────────►
//!                                    └ 5 bytes stay queued
//! ```

pub mod queue;

pub use queue::ChunkQueue;
