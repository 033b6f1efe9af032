//! Chunk and encoding types
//!
//! A chunk is the unit of data moving through a stream:
//!
//! ```text
//! Bytes(Bytes)        binary octets, length = byte count
//! Text(String)        string payload, length = UTF-8 byte count
//! Object(Rc<dyn Any>) object-mode value, length = 1
//! ```
//!
//! `Bytes` is reference counted and immutable, so splitting a chunk hands out
//! a new view without copying and without the two halves aliasing writable
//! storage.

use std::any::Any;
use std::rc::Rc;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::StreamError;

/// Character encoding used to turn text chunks into octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8 (the default)
    #[default]
    Utf8,
    /// One byte per character, code points truncated to 8 bits
    Latin1,
    /// Same byte mapping as latin1
    Ascii,
    /// Pairs of hex digits
    Hex,
    /// Marker for chunks that are already binary
    Buffer,
}

impl Encoding {
    /// Canonical name of the encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Hex => "hex",
            Encoding::Buffer => "buffer",
        }
    }

    /// Encode text into octets
    pub fn encode(&self, text: &str) -> Bytes {
        match self {
            Encoding::Utf8 | Encoding::Buffer => Bytes::copy_from_slice(text.as_bytes()),
            Encoding::Latin1 | Encoding::Ascii => {
                text.chars().map(|c| c as u32 as u8).collect::<Vec<u8>>().into()
            }
            Encoding::Hex => decode_hex(text),
        }
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            "hex" => Ok(Encoding::Hex),
            "buffer" => Ok(Encoding::Buffer),
            _ => Err(StreamError::InvalidEncoding(name.to_string())),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Stops at the first malformed pair.
fn decode_hex(text: &str) -> Bytes {
    let digits = text.as_bytes();
    let mut out = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16);
        let lo = (pair[1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
            _ => break,
        }
    }
    Bytes::from(out)
}

/// A unit of stream payload
#[derive(Clone)]
pub enum Chunk {
    /// Binary octets
    Bytes(Bytes),
    /// Text, converted to octets according to the stream's settings
    Text(String),
    /// Arbitrary value, only accepted in object mode
    Object(Rc<dyn Any>),
}

impl Chunk {
    /// Wrap an arbitrary value as an object-mode chunk
    pub fn object<T: Any>(value: T) -> Self {
        Chunk::Object(Rc::new(value))
    }

    /// Length in stream units (object chunks count as 1)
    pub fn len(&self) -> usize {
        match self {
            Chunk::Bytes(bytes) => bytes.len(),
            Chunk::Text(text) => text.len(),
            Chunk::Object(_) => 1,
        }
    }

    /// Check if the chunk carries no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this is an object-mode value
    pub fn is_object(&self) -> bool {
        matches!(self, Chunk::Object(_))
    }

    /// Borrow the raw octets of a binary or text chunk
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(bytes) => Some(bytes),
            Chunk::Text(text) => Some(text.as_bytes()),
            Chunk::Object(_) => None,
        }
    }

    /// Borrow the payload of a text chunk
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Downcast an object-mode value
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Chunk::Object(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Split off the first `at` units, leaving the remainder in `self`
    ///
    /// Text chunks are converted to bytes first since the split point is a
    /// byte offset. Object chunks are indivisible: splitting at 0 yields an
    /// empty chunk, anything else takes the whole value.
    pub(crate) fn split_to(&mut self, at: usize) -> Chunk {
        match self {
            Chunk::Bytes(bytes) => Chunk::Bytes(bytes.split_to(at.min(bytes.len()))),
            Chunk::Text(text) => {
                let mut bytes = Bytes::from(std::mem::take(text).into_bytes());
                let head = bytes.split_to(at.min(bytes.len()));
                *self = Chunk::Bytes(bytes);
                Chunk::Bytes(head)
            }
            Chunk::Object(_) if at == 0 => Chunk::Bytes(Bytes::new()),
            Chunk::Object(_) => std::mem::replace(self, Chunk::Bytes(Bytes::new())),
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chunk::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Chunk::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Chunk::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Chunk::Object(a), Chunk::Object(b)) => Rc::ptr_eq(a, b),
            (Chunk::Object(_), _) | (_, Chunk::Object(_)) => false,
            _ => self.as_bytes() == other.as_bytes(),
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(bytes: Bytes) -> Self {
        Chunk::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(bytes: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(bytes: &'static [u8]) -> Self {
        Chunk::Bytes(Bytes::from_static(bytes))
    }
}

impl<const N: usize> From<&'static [u8; N]> for Chunk {
    fn from(bytes: &'static [u8; N]) -> Self {
        Chunk::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Chunk {
    fn from(text: String) -> Self {
        Chunk::Text(text)
    }
}

impl From<&str> for Chunk {
    fn from(text: &str) -> Self {
        Chunk::Text(text.to_string())
    }
}
