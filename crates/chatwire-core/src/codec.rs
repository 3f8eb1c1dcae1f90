//! Frame decoding with a reusable, bounded scratch buffer.

use std::{
    io::{self, Read},
    sync::Arc,
};

use serde::{Deserialize, de::IgnoredAny};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::{
    event::BackgroundErrorEvent,
    op::{Op, OpCode},
    registry::PayloadRegistry,
};

/// Default ceiling for retained decode buffer capacity (32 KiB).
pub const MAX_SHARED_BUFFER_SIZE: usize = 1 << 15;

/// Initial capacity of buffers handed out by [`Codec::new_buffer`].
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Problems found while decoding a single frame.
///
/// These never abort a stream: the codec delivers them inside a
/// [`BackgroundErrorEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Cannot read JSON stream: {0}")]
    Stream(#[source] serde_json::Error),
    #[error("Cannot read JSON stream: no frame before end of stream")]
    EndOfStream,
    #[error("Invalid frame envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
    #[error("Unknown event: op {code}, type {event_type:?}")]
    UnknownEvent { code: OpCode, event_type: String },
    #[error("Cannot unmarshal data for op {code} (type {event_type:?}): {source}")]
    Malformed {
        code: OpCode,
        event_type: String,
        source: serde_json::Error,
    },
}

/// Scratch region for the raw bytes of one in-flight frame.
///
/// Not shareable between concurrent decodes; each decode loop owns one.
/// Between calls the buffer is empty, and it never keeps more than
/// `ceiling` bytes of capacity once a call returns.
#[derive(Debug)]
pub struct DecodeBuffer {
    buf: Vec<u8>,
    ceiling: usize,
}

impl DecodeBuffer {
    /// Create a buffer with the default ceiling. `capacity` is clamped to it.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_ceiling(capacity, MAX_SHARED_BUFFER_SIZE)
    }

    /// Create a buffer with an explicit ceiling.
    #[must_use]
    pub fn with_ceiling(capacity: usize, ceiling: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(ceiling)),
            ceiling,
        }
    }

    /// Currently retained capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Empty the buffer, dropping the allocation if a frame grew it past the
    /// ceiling.
    fn reset(&mut self) {
        if self.buf.capacity() > self.ceiling {
            tracing::debug!(
                capacity = self.buf.capacity(),
                ceiling = self.ceiling,
                "dropping oversized decode buffer"
            );
            self.buf = Vec::new();
        } else {
            self.buf.clear();
        }
    }
}

impl Default for DecodeBuffer {
    fn default() -> Self {
        Self::new(INITIAL_BUFFER_SIZE)
    }
}

/// Copies every byte pulled from `inner` into `sink`.
struct Recorder<'a, R> {
    inner: R,
    sink: &'a mut Vec<u8>,
}

impl<R: Read> Read for Recorder<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.sink.extend_from_slice(&out[..n]);
        Ok(n)
    }
}

#[derive(Deserialize)]
struct Envelope<'a> {
    op: OpCode,
    #[serde(default, rename = "s")]
    sequence: Option<u64>,
    #[serde(default, rename = "t")]
    event_type: Option<String>,
    #[serde(default, borrow, rename = "d")]
    data: Option<&'a RawValue>,
}

/// Turns raw gateway frames into [`Op`]s using a [`PayloadRegistry`].
#[derive(Debug, Clone)]
pub struct Codec {
    registry: Arc<PayloadRegistry>,
    buffer_ceiling: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::gateway()
    }
}

impl Codec {
    #[must_use]
    pub fn new(registry: PayloadRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            buffer_ceiling: MAX_SHARED_BUFFER_SIZE,
        }
    }

    /// Codec over [`PayloadRegistry::gateway`].
    #[must_use]
    pub fn gateway() -> Self {
        Self::new(PayloadRegistry::gateway())
    }

    /// Set the ceiling of buffers created by [`Codec::new_buffer`].
    #[must_use]
    pub const fn with_buffer_ceiling(mut self, ceiling: usize) -> Self {
        self.buffer_ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// A fresh scratch buffer sized for this codec.
    #[must_use]
    pub fn new_buffer(&self) -> DecodeBuffer {
        DecodeBuffer::with_ceiling(INITIAL_BUFFER_SIZE, self.buffer_ceiling)
    }

    /// Decode a frame that has already been read in full.
    pub fn decode_frame(&self, frame: &[u8], buf: &mut DecodeBuffer) -> Op {
        self.decode_from(frame, buf)
    }

    /// Read exactly one JSON frame from `reader` and decode it.
    ///
    /// Never fails: unreadable streams, unknown discriminators and malformed
    /// payloads all come back as a background-error op. Bytes following the
    /// frame are left in the reader.
    pub fn decode_from<R: Read>(&self, reader: R, buf: &mut DecodeBuffer) -> Op {
        buf.buf.clear();
        let op = self.decode_staged(reader, &mut buf.buf);
        buf.reset();
        op
    }

    fn decode_staged<R: Read>(&self, reader: R, staging: &mut Vec<u8>) -> Op {
        if let Err(err) = read_value(reader, staging) {
            return background_error(err);
        }

        let envelope: Envelope<'_> = match serde_json::from_slice(staging.as_slice()) {
            Ok(envelope) => envelope,
            Err(err) => return background_error(DecodeError::InvalidEnvelope(err)),
        };

        let code = envelope.op;
        let event_type = envelope.event_type.unwrap_or_default();

        let Some(kind) = self.registry.lookup(code, &event_type) else {
            return background_error(DecodeError::UnknownEvent { code, event_type });
        };

        let data = envelope
            .data
            .map_or(b"null".as_slice(), |raw| raw.get().as_bytes());

        match kind.decode(code, &event_type, data) {
            Ok(payload) => Op {
                code,
                sequence: envelope.sequence,
                event_type,
                payload,
            },
            Err(source) => background_error(DecodeError::Malformed {
                code,
                event_type,
                source,
            }),
        }
    }
}

/// Pull one JSON value out of `reader`, recording its bytes into `staging`.
///
/// The JSON reader consumes input a byte at a time and stops at the end of a
/// self-delimiting value, so nothing past the frame is taken.
fn read_value<R: Read>(reader: R, staging: &mut Vec<u8>) -> Result<(), DecodeError> {
    let recorder = Recorder {
        inner: reader,
        sink: staging,
    };
    let mut values = serde_json::Deserializer::from_reader(recorder).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(IgnoredAny)) => Ok(()),
        Some(Err(err)) => Err(DecodeError::Stream(err)),
        None => Err(DecodeError::EndOfStream),
    }
}

fn background_error(err: DecodeError) -> Op {
    Op::background_error(BackgroundErrorEvent::new(err))
}
