//! Stream error types
//!
//! Expected misuse (writing after end, pushing after EOF, bad chunk types) and
//! hook failures are reported as values. They are recorded on the stream and
//! handed to callbacks or emitted as `error` events, never raised.

/// Error type for stream operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// `write` called after `end`
    WriteAfterEnd,
    /// `end` called on a sink that already finished
    AlreadyFinished,
    /// Operation attempted on a destroyed stream
    Destroyed(&'static str),
    /// `push` called after the end-of-stream marker
    PushAfterEof,
    /// `unshift` called after `end` was emitted
    UnshiftAfterEnd,
    /// Unknown encoding name
    InvalidEncoding(String),
    /// Chunk type not accepted by the stream
    InvalidChunk(&'static str),
    /// A hook (write, read, transform, final, construct, destroy) failed
    Hook(String),
}

impl StreamError {
    /// Create a hook failure from any message
    pub fn hook(message: impl Into<String>) -> Self {
        StreamError::Hook(message.into())
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::WriteAfterEnd => write!(f, "write after end"),
            StreamError::AlreadyFinished => write!(f, "stream already finished"),
            StreamError::Destroyed(op) => {
                write!(f, "cannot call {} after a stream was destroyed", op)
            }
            StreamError::PushAfterEof => write!(f, "stream.push() after EOF"),
            StreamError::UnshiftAfterEnd => {
                write!(f, "stream.unshift() after end event")
            }
            StreamError::InvalidEncoding(name) => write!(f, "Unknown encoding: {}", name),
            StreamError::InvalidChunk(reason) => write!(f, "Invalid chunk: {}", reason),
            StreamError::Hook(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for StreamError {}

/// Result alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// One-shot completion callback handed to hooks and accepted by operations
pub type Callback = Box<dyn FnOnce(Result<()>)>;
