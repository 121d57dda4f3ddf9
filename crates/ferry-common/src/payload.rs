//! Payload and chunk types handed from the relay to the streaming helper.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream};

use crate::Result;

/// Live byte stream of payload chunks, in source order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An immutable buffer on its way to the data channel.
///
/// Not `Clone`: a chunk is moved into the send operation and the producer
/// cannot touch it afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk(Bytes);

impl Chunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Chunk(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Chunk(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Buffer,
    Stream,
}

impl fmt::Display for PayloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadMode::Buffer => f.write_str("buffer"),
            PayloadMode::Stream => f.write_str("stream"),
        }
    }
}

/// Payload as produced by a source; the variant selects the transfer mode.
pub enum Payload {
    /// Entire payload in memory, sent as a single chunk.
    Buffer(Bytes),
    /// Live stream pulled chunk by chunk.
    Stream(ByteStream),
}

impl Payload {
    pub fn mode(&self) -> PayloadMode {
        match self {
            Payload::Buffer(_) => PayloadMode::Buffer,
            Payload::Stream(_) => PayloadMode::Stream,
        }
    }

    /// Stream payload over a fixed list of chunks.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Payload::Stream(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Buffer(data) => f.debug_tuple("Buffer").field(&data.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
